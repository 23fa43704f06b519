//! Outbound flood control.
//!
//! Requests pass an optional per-group bucket and the global bucket before
//! reaching the transport. A retry-after signal from the transport pauses all
//! traffic for the advertised duration plus a small margin, after which the
//! request is retried while its budget lasts.

use crate::bucket::LeakyBucket;
use crate::lifecycle::Lifecycle;
use crate::scope::RequestScope;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const MAX_GROUP_BUCKETS: usize = 512;
pub const RETRY_AFTER_MARGIN: Duration = Duration::from_millis(100);

/// Implemented by transport errors so the limiter can spot flood-control replies.
pub trait ThrottleSignal {
    fn retry_after(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_overall_max_rate")]
    pub overall_max_rate: u32,
    #[serde(default = "default_overall_time_period_secs")]
    pub overall_time_period_secs: f64,
    #[serde(default = "default_group_max_rate")]
    pub group_max_rate: u32,
    #[serde(default = "default_group_time_period_secs")]
    pub group_time_period_secs: f64,
    /// Retries after a retry-after signal, unless a call overrides it.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_overall_max_rate() -> u32 {
    30
}

fn default_overall_time_period_secs() -> f64 {
    1.0
}

fn default_group_max_rate() -> u32 {
    20
}

fn default_group_time_period_secs() -> f64 {
    60.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            overall_max_rate: default_overall_max_rate(),
            overall_time_period_secs: default_overall_time_period_secs(),
            group_max_rate: default_group_max_rate(),
            group_time_period_secs: default_group_time_period_secs(),
            max_retries: 0,
        }
    }
}

fn period(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(period) => period,
        // Too long to represent: the strictest bucket, never a disabled one.
        Err(_) if secs > 0.0 => Duration::MAX,
        Err(_) => {
            tracing::warn!(secs, "invalid rate limit period; bucket disabled");
            Duration::ZERO
        }
    }
}

/// Gate closed until a deadline; extended, never shortened, by new pauses.
#[derive(Debug, Default)]
struct PauseGate {
    until: Mutex<Option<Instant>>,
}

impl PauseGate {
    fn pause_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        if until.is_none_or(|current| current < deadline) {
            *until = Some(deadline);
        }
    }

    async fn wait(&self) {
        loop {
            let deadline = *self.until.lock().unwrap_or_else(PoisonError::into_inner);
            match deadline {
                Some(deadline) if deadline > Instant::now() => {
                    tokio::time::sleep_until(deadline).await
                }
                _ => return,
            }
        }
    }
}

pub struct RateLimiter {
    overall: Option<LeakyBucket>,
    group_max_rate: u32,
    group_period: Duration,
    groups: DashMap<String, Arc<LeakyBucket>>,
    pause: PauseGate,
    max_retries: u32,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let overall = LeakyBucket::new(cfg.overall_max_rate, period(cfg.overall_time_period_secs));
        let group_period = period(cfg.group_time_period_secs);
        if overall.is_none() {
            tracing::info!("global rate limit disabled");
        }
        if cfg.group_max_rate == 0 || group_period.is_zero() {
            tracing::info!("per-group rate limit disabled");
        }
        Self {
            overall,
            group_max_rate: cfg.group_max_rate,
            group_period,
            groups: DashMap::new(),
            pause: PauseGate::default(),
            max_retries: cfg.max_retries,
        }
    }

    pub fn group_bucket_count(&self) -> usize {
        self.groups.len()
    }

    /// Run `callback` under the buckets that apply to `data`, retrying
    /// retry-after failures up to `retry_budget` times (the configured
    /// default when `None`). Any other error, or the last throttling error
    /// once the budget is spent, is returned as the transport produced it.
    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %endpoint))]
    pub async fn process_request<T, E, F, Fut>(
        &self,
        mut callback: F,
        endpoint: &str,
        data: &Value,
        retry_budget: Option<u32>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ThrottleSignal + Display,
    {
        let max_retries = retry_budget.unwrap_or(self.max_retries);
        let scope = RequestScope::classify(data);
        let mut attempt = 0_u32;
        loop {
            let error = match self.run_request(&scope, &mut callback).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let Some(retry_after) = error.retry_after() else {
                return Err(error);
            };
            if attempt >= max_retries {
                tracing::error!(
                    %endpoint,
                    max_retries,
                    %error,
                    "rate limit hit after maximum retries"
                );
                return Err(error);
            }
            attempt += 1;
            let pause = retry_after + RETRY_AFTER_MARGIN;
            tracing::info!(%endpoint, attempt, ?pause, "rate limit hit; pausing all requests");
            self.pause.pause_for(pause);
        }
    }

    async fn run_request<T, E, F, Fut>(
        &self,
        scope: &RequestScope,
        callback: &mut F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.pause.wait().await;

        if let RequestScope::Group(group_id) = scope {
            if let Some(bucket) = self.group_bucket(group_id) {
                bucket.acquire().await;
            }
        }
        if scope.is_chat_bound() {
            if let Some(overall) = &self.overall {
                overall.acquire().await;
            }
        }

        // A pause may have started while we queued for capacity.
        self.pause.wait().await;
        callback().await
    }

    fn group_bucket(&self, group_id: &str) -> Option<Arc<LeakyBucket>> {
        if let Some(bucket) = self.groups.get(group_id) {
            return Some(bucket.value().clone());
        }
        let bucket = Arc::new(LeakyBucket::new(self.group_max_rate, self.group_period)?);
        let bucket = self
            .groups
            .entry(group_id.to_string())
            .or_insert(bucket)
            .value()
            .clone();
        if self.groups.len() > MAX_GROUP_BUCKETS {
            self.evict_idle_groups(group_id);
        }
        Some(bucket)
    }

    fn evict_idle_groups(&self, current: &str) {
        let before = self.groups.len();
        self.groups.retain(|id, bucket| {
            id == current || Arc::strong_count(bucket) > 1 || !bucket.is_idle()
        });
        tracing::debug!(
            before,
            after = self.groups.len(),
            "swept idle group rate limiters"
        );
    }
}

#[async_trait]
impl Lifecycle for RateLimiter {
    async fn shutdown(&self) -> anyhow::Result<()> {
        self.groups.clear();
        Ok(())
    }
}
