//! Bounded update processing.
//!
//! [`UpdateProcessor`] admits at most `max_concurrent` units of work at once.
//! Waiting units take whichever slot frees first; no further ordering holds.

use crate::error::{LimitError, Result};
use crate::lifecycle::Lifecycle;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Overridable behavior around each admitted update.
#[async_trait]
pub trait ProcessorHooks: Send + Sync {
    type Update: Send + Sync;

    /// Runs inside a slot. The default just drives the work to completion.
    async fn do_process_update(&self, _update: &Self::Update, work: BoxFuture<'static, ()>) {
        work.await
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that add nothing.
pub struct SimpleUpdates<U>(PhantomData<fn() -> U>);

impl<U> Default for SimpleUpdates<U> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<U: Send + Sync> ProcessorHooks for SimpleUpdates<U> {
    type Update = U;
}

pub struct UpdateProcessor<H: ProcessorHooks> {
    hooks: H,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl<U: Send + Sync> UpdateProcessor<SimpleUpdates<U>> {
    pub fn simple(max_concurrent: usize) -> Result<Self> {
        Self::new(max_concurrent, SimpleUpdates::default())
    }
}

impl<H: ProcessorHooks> UpdateProcessor<H> {
    pub fn new(max_concurrent: usize, hooks: H) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(LimitError::InvalidConcurrency(max_concurrent));
        }
        Ok(Self {
            hooks,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        })
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Units currently between admission and completion.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    /// Wait for a slot, run `work` through the hooks, release the slot.
    pub async fn process_update<W>(&self, update: &H::Update, work: W) -> Result<()>
    where
        W: Future<Output = ()> + Send + 'static,
    {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| LimitError::ProcessorClosed)?;
        self.hooks.do_process_update(update, Box::pin(work)).await;
        Ok(())
    }
}

#[async_trait]
impl<H: ProcessorHooks> Lifecycle for UpdateProcessor<H> {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.hooks.initialize().await
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.hooks.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    async fn run_batch(max_concurrent: usize, units: usize, hold: Duration) -> Vec<Duration> {
        let processor = Arc::new(
            UpdateProcessor::<SimpleUpdates<usize>>::simple(max_concurrent).expect("processor"),
        );
        let started = Instant::now();
        let finished = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..units)
            .map(|id| {
                let processor = processor.clone();
                let finished = finished.clone();
                tokio::spawn(async move {
                    let work = {
                        let finished = finished.clone();
                        async move {
                            tokio::time::sleep(hold).await;
                            finished.lock().expect("lock").push(started.elapsed());
                        }
                    };
                    processor.process_update(&id, work).await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("process");
        }
        assert_eq!(processor.in_flight(), 0);

        let mut times = finished.lock().expect("lock").clone();
        times.sort();
        times
    }

    fn waves(times: &[Duration], hold: Duration) -> Vec<usize> {
        let mut counts = Vec::new();
        for t in times {
            let wave = (t.as_millis() / hold.as_millis()) as usize;
            if counts.len() < wave {
                counts.resize(wave, 0);
            }
            counts[wave - 1] += 1;
        }
        counts
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = UpdateProcessor::<SimpleUpdates<()>>::simple(0)
            .err()
            .expect("zero slots is invalid");
        assert!(matches!(err, LimitError::InvalidConcurrency(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn five_units_on_two_slots_finish_in_three_waves() {
        let hold = Duration::from_millis(100);
        let times = run_batch(2, 5, hold).await;
        assert_eq!(waves(&times, hold), vec![2, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn twice_the_capacity_finishes_k_per_window() {
        let hold = Duration::from_millis(250);
        let k = 4;
        let times = run_batch(k, 2 * k, hold).await;
        assert_eq!(waves(&times, hold), vec![k, k]);
    }

    struct Counting {
        seen: AtomicUsize,
        peak: AtomicUsize,
        active: AtomicUsize,
    }

    #[async_trait]
    impl ProcessorHooks for Counting {
        type Update = u64;

        async fn do_process_update(&self, update: &u64, work: BoxFuture<'static, ()>) {
            self.seen.fetch_add(*update as usize, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            work.await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn custom_hooks_observe_every_update_within_the_bound() {
        let processor = Arc::new(
            UpdateProcessor::new(
                3,
                Counting {
                    seen: AtomicUsize::new(0),
                    peak: AtomicUsize::new(0),
                    active: AtomicUsize::new(0),
                },
            )
            .expect("processor"),
        );

        let tasks: Vec<_> = (1..=10_u64)
            .map(|update| {
                let processor = processor.clone();
                tokio::spawn(async move {
                    processor
                        .process_update(&update, tokio::time::sleep(Duration::from_millis(10)))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("process");
        }

        assert_eq!(processor.hooks().seen.load(Ordering::SeqCst), 55);
        assert_eq!(processor.hooks().peak.load(Ordering::SeqCst), 3);
    }
}
