//! Leaky-bucket limiter: up to `max_rate` acquisitions per `period`, drained
//! continuously. Waiters are served first come, first served.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const EPSILON: f64 = 1e-9;

#[derive(Debug)]
pub struct LeakyBucket {
    max_rate: f64,
    drain_per_sec: f64,
    level: Mutex<Level>,
    queue: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct Level {
    value: f64,
    last_leak: Instant,
}

impl LeakyBucket {
    /// `None` when either the rate or the period is zero: the bucket is disabled.
    pub fn new(max_rate: u32, period: Duration) -> Option<Self> {
        if max_rate == 0 || period.is_zero() {
            return None;
        }
        let max_rate = f64::from(max_rate);
        Some(Self {
            max_rate,
            drain_per_sec: max_rate / period.as_secs_f64(),
            level: Mutex::new(Level {
                value: 0.0,
                last_leak: Instant::now(),
            }),
            queue: tokio::sync::Mutex::new(()),
        })
    }

    pub fn has_capacity(&self, amount: f64) -> bool {
        let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
        self.leak(&mut level);
        level.value + amount <= self.max_rate + EPSILON
    }

    /// True when nothing is queued in the bucket.
    pub fn is_idle(&self) -> bool {
        self.has_capacity(self.max_rate)
    }

    /// Take one unit of capacity, waiting until it is available.
    pub async fn acquire(&self) {
        let _turn = self.queue.lock().await;
        loop {
            let wait = {
                let mut level = self.level.lock().unwrap_or_else(PoisonError::into_inner);
                self.leak(&mut level);
                let excess = level.value + 1.0 - self.max_rate;
                if excess <= EPSILON {
                    level.value += 1.0;
                    return;
                }
                Duration::try_from_secs_f64(excess / self.drain_per_sec).unwrap_or(Duration::MAX)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn leak(&self, level: &mut Level) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(level.last_leak).as_secs_f64();
        level.value = (level.value - elapsed * self.drain_per_sec).max(0.0);
        level.last_leak = now;
    }
}
