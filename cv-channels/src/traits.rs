use crate::error::Result;
use crate::types::{ChatId, InboundUpdate, OutboundMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving updates. Push to tx for each inbound update.
    async fn start(&self, tx: mpsc::Sender<InboundUpdate>) -> anyhow::Result<()>;

    /// Send a message to a chat on this platform.
    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<()>;
}
