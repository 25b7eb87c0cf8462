//! Manager-side scheduling core: session rows and state machines, the
//! repository boundary, admission predicates, queueing policies, agent
//! selectors, the dispatcher loop, and resource accounting.

pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod models;
pub mod registry;
pub mod repository;
pub mod sched;
pub mod statestore;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ManagerConfig;
pub use error::{Result, SchedulingError};
pub use events::{EventProducer, SchedulingEvent};
pub use lock::{LocalLockFactory, LockFactory, LockId};
pub use registry::AgentRegistry;
pub use repository::ScheduleRepository;
pub use sched::{
    AgentClient, EchoAgentClient, SchedulerDispatcher, SchedulingContext,
};
pub use statestore::StateStore;
