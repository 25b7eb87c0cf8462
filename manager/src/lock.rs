//! Inter-manager locks guarding the scheduler stages.
//!
//! Acquisition is try-once: a lock held elsewhere silently skips the
//! current tick, which the next timer firing retries. The trait is the
//! seam for a distributed implementation; the local factory serializes
//! stages within one process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockId {
    Schedule,
    CheckPrecond,
    Start,
    ScaleTimer,
    SessionStatusUpdateTimer,
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Schedule => f.write_str("schedule"),
            LockId::CheckPrecond => f.write_str("check_precond"),
            LockId::Start => f.write_str("start"),
            LockId::ScaleTimer => f.write_str("scale_timer"),
            LockId::SessionStatusUpdateTimer => f.write_str("session_status_update_timer"),
        }
    }
}

/// Held lock; releasing is dropping.
pub trait LockGuard: Send {}

#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Try to acquire without blocking. `lifetime` is the TTL a distributed
    /// backend applies so a crashed holder cannot wedge the fleet.
    async fn try_acquire(&self, id: LockId, lifetime: Duration) -> Option<Box<dyn LockGuard>>;
}

#[derive(Default)]
pub struct LocalLockFactory {
    locks: DashMap<LockId, Arc<Mutex<()>>>,
}

impl LocalLockFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard for LocalLockGuard {}

#[async_trait]
impl LockFactory for LocalLockFactory {
    async fn try_acquire(&self, id: LockId, _lifetime: Duration) -> Option<Box<dyn LockGuard>> {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match mutex.try_lock_owned() {
            Ok(guard) => Some(Box::new(LocalLockGuard { _guard: guard })),
            Err(_) => None,
        }
    }
}
