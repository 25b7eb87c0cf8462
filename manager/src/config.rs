//! Manager configuration, loadable from TOML with `GRIDMESH_`-prefixed
//! environment overrides.

use crate::error::{Result, SchedulingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Manager instance id, used to key scheduler marks.
    pub id: String,
    /// Scheduling tick period.
    pub schedule_interval_secs: u64,
    /// Agents silent longer than this are marked LOST.
    pub heartbeat_timeout_secs: u64,
    pub schedule_lock_lifetime_secs: u64,
    pub check_precond_lock_lifetime_secs: u64,
    pub start_lock_lifetime_secs: u64,
    /// Bounds PREPARED -> RUNNING for one session.
    pub start_session_timeout_secs: u64,
    /// Hard cap of containers per agent; `None` disables the filter.
    pub max_container_count: Option<u32>,
    /// Slot ordering used by agent selectors when comparing capacities.
    pub agent_selection_resource_priority: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            id: "manager-1".to_owned(),
            schedule_interval_secs: 10,
            heartbeat_timeout_secs: 40,
            schedule_lock_lifetime_secs: 30,
            check_precond_lock_lifetime_secs: 30,
            start_lock_lifetime_secs: 30,
            start_session_timeout_secs: 120,
            max_container_count: None,
            agent_selection_resource_priority: vec![
                "cuda.device".to_owned(),
                "cuda.shares".to_owned(),
                "cpu".to_owned(),
                "mem".to_owned(),
            ],
        }
    }
}

impl ManagerConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn schedule_lock_lifetime(&self) -> Duration {
        Duration::from_secs(self.schedule_lock_lifetime_secs)
    }

    pub fn check_precond_lock_lifetime(&self) -> Duration {
        Duration::from_secs(self.check_precond_lock_lifetime_secs)
    }

    pub fn start_lock_lifetime(&self) -> Duration {
        Duration::from_secs(self.start_lock_lifetime_secs)
    }

    pub fn start_session_timeout(&self) -> Duration {
        Duration::from_secs(self.start_session_timeout_secs)
    }

    /// Load from an optional TOML file, then apply `GRIDMESH_*` environment
    /// overrides on top of the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("GRIDMESH"));
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SchedulingError::internal(format!("configuration error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = ManagerConfig::default();
        assert_eq!(config.schedule_interval(), Duration::from_secs(10));
        assert!(config.max_container_count.is_none());
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "id = \"mgr-7\"\nschedule_interval_secs = 3").unwrap();
        let config = ManagerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.id, "mgr-7");
        assert_eq!(config.schedule_interval(), Duration::from_secs(3));
        assert_eq!(config.heartbeat_timeout_secs, 40);
    }
}
