//! Inbound loop: every update is admitted by the bounded processor, routed
//! through the conversation and answered on its channel.

use crate::conversation::Conversation;
use anyhow::Result;
use async_trait::async_trait;
use cv_channels::{ChannelAdapter, InboundUpdate, OutboundMessage};
use cv_limits::{ProcessorHooks, UpdateProcessor};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Processor hooks that give each update its own span and keep a tally.
#[derive(Default)]
pub struct TracedUpdates {
    processed: AtomicU64,
}

impl TracedUpdates {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ProcessorHooks for TracedUpdates {
    type Update = InboundUpdate;

    async fn do_process_update(&self, update: &InboundUpdate, work: BoxFuture<'static, ()>) {
        let span = tracing::info_span!(
            "update",
            update_id = update.update_id,
            chat_id = %update.chat_id,
            is_group = update.is_group,
        );
        work.instrument(span).await;
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(processed = self.processed(), "update processor stopped");
        Ok(())
    }
}

pub struct Gateway {
    channel: Arc<dyn ChannelAdapter>,
    processor: Arc<UpdateProcessor<TracedUpdates>>,
    conversation: Arc<Conversation>,
    tasks: TaskTracker,
}

impl Gateway {
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        processor: Arc<UpdateProcessor<TracedUpdates>>,
        conversation: Arc<Conversation>,
    ) -> Self {
        Self {
            channel,
            processor,
            conversation,
            tasks: TaskTracker::new(),
        }
    }

    /// Pull updates until the queue closes or `shutdown` fires, then wait
    /// for admitted work to finish.
    #[tracing::instrument(level = "info", skip_all, fields(channel = %self.channel.channel_id()))]
    pub async fn run(
        &self,
        mut inbound_rx: mpsc::Receiver<InboundUpdate>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let update = tokio::select! {
                _ = shutdown.cancelled() => break,
                update = inbound_rx.recv() => update,
            };
            let Some(update) = update else {
                tracing::warn!("inbound queue closed");
                break;
            };
            self.dispatch(update);
        }

        self.tasks.close();
        tracing::info!(
            in_flight = self.processor.in_flight(),
            "waiting for in-flight updates"
        );
        self.tasks.wait().await;
        Ok(())
    }

    fn dispatch(&self, update: InboundUpdate) {
        let processor = self.processor.clone();
        let work = handle_update(self.channel.clone(), self.conversation.clone(), update.clone());
        self.tasks.spawn(async move {
            if let Err(e) = processor.process_update(&update, work).await {
                tracing::error!(update_id = update.update_id, %e, "update rejected");
            }
        });
    }
}

async fn handle_update(
    channel: Arc<dyn ChannelAdapter>,
    conversation: Arc<Conversation>,
    update: InboundUpdate,
) {
    let reply = match conversation.handle(&update).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(%e, "conversation failed");
            return;
        }
    };
    let message = OutboundMessage {
        content: reply,
        reply_to_message_id: update.message_id.clone(),
    };
    if let Err(e) = channel.send(&update.chat_id, message).await {
        tracing::warn!(%e, chat_id = %update.chat_id, "reply failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationBackend, Flow};
    use chrono::Utc;
    use cv_channels::{ChatId, UserId};
    use cv_state::{JobScheduler, StateMachine, TokioJobScheduler};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingChannel {
        fn channel_id(&self) -> &str {
            "recording"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundUpdate>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            chat_id: &ChatId,
            message: OutboundMessage,
        ) -> cv_channels::Result<()> {
            self.sent
                .lock()
                .expect("sent lock")
                .push((chat_id.to_string(), message.content));
            Ok(())
        }
    }

    fn update(update_id: i64, chat: &str, text: &str) -> InboundUpdate {
        InboundUpdate {
            update_id,
            message_id: None,
            chat_id: ChatId::new(chat),
            sender_id: Some(UserId::new(chat)),
            is_group: false,
            content: text.to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replies_to_every_chat_and_drains_on_close() {
        let channel = Arc::new(RecordingChannel::default());
        let scheduler: Arc<dyn JobScheduler> = Arc::new(TokioJobScheduler::new());
        let machine = StateMachine::new(Arc::new(ConversationBackend::new()), scheduler);
        let conversation = Arc::new(Conversation::new(
            machine,
            Flow::register().expect("flow"),
            Duration::from_secs(60),
        ));
        let processor =
            Arc::new(UpdateProcessor::new(2, TracedUpdates::default()).expect("processor"));
        let gateway = Gateway::new(channel.clone(), processor.clone(), conversation);

        let (tx, rx) = mpsc::channel(16);
        for (id, chat) in ["1", "2", "3", "4", "5"].into_iter().enumerate() {
            tx.send(update(id as i64, chat, "/start")).await.expect("queue");
        }
        drop(tx);

        gateway
            .run(rx, CancellationToken::new())
            .await
            .expect("gateway run");

        assert_eq!(processor.hooks().processed(), 5);
        assert_eq!(processor.in_flight(), 0);
        let mut chats: Vec<String> = channel
            .sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(chat, _)| chat.clone())
            .collect();
        chats.sort();
        assert_eq!(chats, vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn stops_when_shutdown_fires() {
        let channel = Arc::new(RecordingChannel::default());
        let scheduler: Arc<dyn JobScheduler> = Arc::new(TokioJobScheduler::new());
        let machine = StateMachine::new(Arc::new(ConversationBackend::new()), scheduler);
        let conversation = Arc::new(Conversation::new(
            machine,
            Flow::register().expect("flow"),
            Duration::from_secs(60),
        ));
        let processor =
            Arc::new(UpdateProcessor::new(1, TracedUpdates::default()).expect("processor"));
        let gateway = Gateway::new(channel, processor, conversation);

        let (_tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        gateway.run(rx, shutdown).await.expect("gateway run");
    }
}
