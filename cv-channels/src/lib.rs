mod error;
mod telegram;
mod traits;
mod types;

pub use error::{ChannelError, Result};
pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{ChatId, InboundUpdate, MessageId, OutboundMessage, UserId};
