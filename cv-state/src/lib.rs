//! Conversation state for Convoy.
//!
//! Boolean state expressions, a keyed state machine with per-key locking, and
//! the timeout scheduler it cancels jobs through.

mod algebra;
mod error;
mod locks;
mod machine;
mod scheduler;
mod store;

pub use algebra::{ANY_UID, BUSY_UID, IDLE_UID, State};
pub use error::{Result, SchedulerError, StateError};
pub use locks::{KeyGuard, KeyLocks};
pub use machine::StateMachine;
pub use scheduler::{JobCallback, JobHandle, JobScheduler, TokioJobScheduler};
pub use store::{MemoryStateStore, StateBackend};
