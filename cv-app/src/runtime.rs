//! Process wiring for `serve` and `doctor`.

use crate::config::ConvoyConfig;
use crate::conversation::{Conversation, ConversationBackend, Flow};
use crate::gateway::{Gateway, TracedUpdates};
use anyhow::Result;
use async_trait::async_trait;
use cv_channels::{ChannelAdapter, TelegramAdapter};
use cv_limits::{Lifecycle, LifecycleStack, RateLimiter, UpdateProcessor, scoped};
use cv_state::{JobScheduler, StateMachine, TokioJobScheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cancels pending timeout jobs on shutdown.
struct SchedulerLifecycle(Arc<TokioJobScheduler>);

#[async_trait]
impl Lifecycle for SchedulerLifecycle {
    async fn shutdown(&self) -> Result<()> {
        self.0.shutdown().await;
        Ok(())
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ConvoyConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        max_concurrent_updates = cfg.max_concurrent_updates(),
        overall_max_rate = cfg.rate_limit.overall_max_rate,
        group_max_rate = cfg.rate_limit.group_max_rate,
        max_retries = cfg.rate_limit.max_retries,
        conversation_timeout_secs = cfg.conversation.timeout_secs,
        "config ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = ConvoyConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        max_concurrent_updates = cfg.max_concurrent_updates(),
        "starting convoy"
    );

    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
    let scheduler = Arc::new(TokioJobScheduler::new());
    let processor = Arc::new(UpdateProcessor::new(
        cfg.max_concurrent_updates(),
        TracedUpdates::default(),
    )?);

    let mut telegram = TelegramAdapter::new(&cfg.telegram.bot_token, limiter.clone())?;
    if let Some(api_base) = &cfg.telegram.api_base {
        telegram = telegram.with_api_base(api_base.clone());
    }
    let channel: Arc<dyn ChannelAdapter> = Arc::new(telegram);

    let machine = StateMachine::new(
        Arc::new(ConversationBackend::new()),
        scheduler.clone() as Arc<dyn JobScheduler>,
    );
    let conversation = Arc::new(Conversation::new(
        machine,
        Flow::register()?,
        cfg.conversation.timeout(),
    ));
    let gateway = Gateway::new(channel.clone(), processor.clone(), conversation);

    // Shut down in reverse: processor first, scheduler last.
    let stack = LifecycleStack::new()
        .push("scheduler", Arc::new(SchedulerLifecycle(scheduler)))
        .push("rate_limiter", limiter)
        .push("update_processor", processor);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let queue_capacity = cfg.updates.inbound_queue_capacity;
    scoped(&stack, move || async move {
        let (tx, rx) = mpsc::channel(queue_capacity);
        channel.start(tx).await?;
        tracing::info!(channel = %channel.channel_id(), "channel started");
        gateway.run(rx, shutdown).await
    })
    .await?;

    tracing::info!("convoy stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
