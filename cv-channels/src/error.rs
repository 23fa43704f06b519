use cv_limits::ThrottleSignal;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("flood control exceeded; retry after {0:?}")]
    RetryAfter(Duration),

    #[error("api error {code}: {description}")]
    Api { code: u16, description: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl ThrottleSignal for ChannelError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter(after) => Some(*after),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
