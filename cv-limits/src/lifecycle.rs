//! Paired initialize/shutdown for components that may hold connections.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Run `body` between `initialize` and `shutdown`.
///
/// `shutdown` runs on every exit path, including a failed `initialize`. A
/// body error wins over a shutdown error; the latter is logged.
pub async fn scoped<L, F, Fut, T>(resource: &L, body: F) -> Result<T>
where
    L: Lifecycle + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Err(e) = resource.initialize().await {
        if let Err(shutdown_err) = resource.shutdown().await {
            tracing::warn!(error = %shutdown_err, "shutdown after failed initialize also failed");
        }
        return Err(e);
    }

    let result = body().await;
    let shutdown = resource.shutdown().await;
    match (result, shutdown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(shutdown_err)) => {
            tracing::warn!(error = %shutdown_err, "shutdown failed after body error");
            Err(e)
        }
    }
}

/// Several lifecycles treated as one: initialized in order, shut down in
/// reverse. A failing member is shut down together with everything before it.
#[derive(Default)]
pub struct LifecycleStack {
    members: Vec<(String, Arc<dyn Lifecycle>)>,
    initialized: AtomicUsize,
}

impl LifecycleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, name: impl Into<String>, member: Arc<dyn Lifecycle>) -> Self {
        self.members.push((name.into(), member));
        self
    }

    async fn shutdown_first(&self, count: usize) -> Result<()> {
        let mut first_err = None;
        for (name, member) in self.members[..count].iter().rev() {
            match member.shutdown().await {
                Ok(()) => tracing::debug!(component = %name, "shut down"),
                Err(e) => {
                    tracing::warn!(component = %name, error = %e, "shutdown failed");
                    if first_err.is_none() {
                        first_err = Some(e.context(format!("shutdown {name}")));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Lifecycle for LifecycleStack {
    async fn initialize(&self) -> Result<()> {
        for (index, (name, member)) in self.members.iter().enumerate() {
            if let Err(e) = member.initialize().await {
                tracing::error!(component = %name, error = %e, "initialize failed; unwinding");
                self.initialized.store(0, Ordering::SeqCst);
                // Include the failing member: it may have acquired part of its resources.
                let _ = self.shutdown_first(index + 1).await;
                return Err(e).with_context(|| format!("initialize {name}"));
            }
            self.initialized.store(index + 1, Ordering::SeqCst);
            tracing::debug!(component = %name, "initialized");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let count = self.initialized.swap(0, Ordering::SeqCst);
        self.shutdown_first(count).await
    }
}
