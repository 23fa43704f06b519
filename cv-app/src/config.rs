//! Convoy configuration loader.

use cv_limits::RateLimitConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Override for self-hosted Bot API servers.
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatesConfig {
    /// Signed so a negative value in the file is reported, not wrapped.
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: i64,
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            max_concurrent_updates: default_max_concurrent_updates(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
        }
    }
}

fn default_max_concurrent_updates() -> i64 {
    8
}

fn default_inbound_queue_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    /// Idle conversations are reset after this many seconds.
    #[serde(default = "default_conversation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_conversation_timeout_secs(),
        }
    }
}

fn default_conversation_timeout_secs() -> u64 {
    300
}

impl ConversationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ConvoyConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        for var in ["TELEGRAM_BOT_TOKEN", "CONVOY_BOT_TOKEN"] {
            if let Ok(v) = std::env::var(var) {
                if !v.trim().is_empty() {
                    self.telegram.bot_token = v;
                }
            }
        }
        if let Ok(v) = std::env::var("CONVOY_MAX_CONCURRENT_UPDATES") {
            match v.trim().parse::<i64>() {
                Ok(n) => self.updates.max_concurrent_updates = n,
                Err(e) => tracing::warn!(
                    value = %v,
                    error = %e,
                    "ignoring unparseable CONVOY_MAX_CONCURRENT_UPDATES"
                ),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set CONVOY_BOT_TOKEN)"
            ));
        }
        if self.updates.max_concurrent_updates <= 0 {
            return Err(anyhow::anyhow!(
                "updates.max_concurrent_updates must be > 0, got {}",
                self.updates.max_concurrent_updates
            ));
        }
        if self.updates.inbound_queue_capacity == 0 {
            return Err(anyhow::anyhow!("updates.inbound_queue_capacity must be > 0"));
        }
        if self.conversation.timeout_secs == 0 {
            return Err(anyhow::anyhow!("conversation.timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Validated concurrency bound.
    pub fn max_concurrent_updates(&self) -> usize {
        usize::try_from(self.updates.max_concurrent_updates).unwrap_or(1).max(1)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".convoy").join("config.toml")
}
