use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state uid already registered: {0}")]
    DuplicateUid(String),

    #[error("invalid state uid {0:?}: must be non-empty and free of ~&|^()")]
    InvalidUid(String),

    #[error("ANY can be matched against but never stored as an active state")]
    AnyNotAllowed,

    #[error("key {0} is locked by a transition in progress")]
    Locked(String),

    #[error("storage hook failed: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl StateError {
    /// True for the contention error raised by a non-waiting transition.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job scheduler is shut down")]
    ShutDown,

    #[error("job scheduler failed: {0}")]
    Backend(String),
}
