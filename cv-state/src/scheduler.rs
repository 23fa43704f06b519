//! One-shot delayed jobs, findable and cancellable by name.

use crate::error::SchedulerError;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Receives its own handle: a job that waits on something before acting should
/// re-check [`JobHandle::is_cancelled`] once it gets there.
pub type JobCallback = Box<dyn FnOnce(Arc<dyn JobHandle>) -> BoxFuture<'static, ()> + Send>;

pub trait JobHandle: Send + Sync {
    fn name(&self) -> &str;
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

/// Delayed-invocation collaborator used for conversation timeouts.
pub trait JobScheduler: Send + Sync {
    /// Invoke `callback` once, `when` from now, under the given job name.
    fn run_once(
        &self,
        callback: JobCallback,
        when: Duration,
        name: String,
    ) -> Result<Arc<dyn JobHandle>, SchedulerError>;

    /// Pending jobs whose name contains `fragment`.
    fn jobs_matching(&self, fragment: &str) -> Vec<Arc<dyn JobHandle>>;
}

struct ScheduledJob {
    name: String,
    token: CancellationToken,
}

impl JobHandle for ScheduledJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// In-process scheduler: one sleeping task per job.
pub struct TokioJobScheduler {
    jobs: Arc<DashMap<u64, Arc<ScheduledJob>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Default for TokioJobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioJobScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Cancel every pending job and wait briefly for their tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for scheduled jobs to shut down");
        }
        self.jobs.clear();
    }
}

impl JobScheduler for TokioJobScheduler {
    fn run_once(
        &self,
        callback: JobCallback,
        when: Duration,
        name: String,
    ) -> Result<Arc<dyn JobHandle>, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(ScheduledJob {
            name,
            token: self.shutdown.child_token(),
        });
        self.jobs.insert(id, job.clone());

        let jobs = self.jobs.clone();
        let task_job = job.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = task_job.token.cancelled() => {
                    tracing::debug!(job = %task_job.name, "scheduled job cancelled");
                }
                _ = tokio::time::sleep(when) => {
                    // Stays listed while the callback runs so a late
                    // transition can still cancel it.
                    tracing::debug!(job = %task_job.name, "scheduled job firing");
                    callback(task_job.clone() as Arc<dyn JobHandle>).await;
                }
            }
            jobs.remove(&id);
        });
        tracing::debug!(job = %job.name, ?when, "scheduled job");
        Ok(job)
    }

    fn jobs_matching(&self, fragment: &str) -> Vec<Arc<dyn JobHandle>> {
        self.jobs
            .iter()
            .filter(|entry| !entry.token.is_cancelled() && entry.name.contains(fragment))
            .map(|entry| entry.value().clone() as Arc<dyn JobHandle>)
            .collect()
    }
}
