use thiserror::Error;

pub type Result<T> = std::result::Result<T, LimitError>;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("max_concurrent_updates must be a positive integer, got {0}")]
    InvalidConcurrency(usize),

    #[error("update processor is closed")]
    ProcessorClosed,
}
