use crate::error::{ChannelError, Result};
use crate::traits::ChannelAdapter;
use crate::types::{ChatId, InboundUpdate, MessageId, OutboundMessage, UserId};
use chrono::Utc;
use cv_limits::RateLimiter;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: u64 = 30;
const TELEGRAM_NON_TEXT_PLACEHOLDER: &str = "[telegram non-text message]";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

/// Telegram Bot API transport. Every call passes through the shared
/// [`RateLimiter`], so flood-control replies pause the whole client.
#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    limiter: Arc<RateLimiter>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(TELEGRAM_LONG_POLL_TIMEOUT_SECS + 30))
            .build()?;
        Ok(Self {
            http,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.to_string(),
            limiter,
        })
    }

    /// Point the adapter at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Call a Bot API method through the rate limiter.
    pub async fn call<R: DeserializeOwned + Send>(&self, method: &str, body: Value) -> Result<R> {
        self.limiter
            .process_request(|| self.post_once(method, &body), method, &body, None)
            .await
    }

    async fn post_once<R: DeserializeOwned + Send>(&self, method: &str, body: &Value) -> Result<R> {
        let response = self
            .http
            .post(self.api_url(method))
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        decode_response(status, &text)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundUpdate>) -> anyhow::Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<()> {
        let mut body = json!({
            "chat_id": chat_id.as_str(),
            "text": message.content,
        });
        if let Some(reply_to) = message
            .reply_to_message_id
            .as_ref()
            .and_then(|id| id.parse::<i64>().ok())
        {
            body["reply_parameters"] = json!({ "message_id": reply_to });
        }
        let _: Value = self.call("sendMessage", body).await?;
        Ok(())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundUpdate>) -> anyhow::Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let body = json!({
                "timeout": TELEGRAM_LONG_POLL_TIMEOUT_SECS,
                "offset": offset,
                "allowed_updates": ["message"],
            });
            let mut updates = match self.call::<Vec<TelegramUpdate>>("getUpdates", body).await {
                Ok(updates) => updates,
                Err(error) => {
                    let delay = match &error {
                        ChannelError::RetryAfter(after) => *after,
                        error if is_transient(error) => {
                            consecutive_failures += 1;
                            transient_retry_delay(consecutive_failures)
                        }
                        _ => {
                            consecutive_failures = 0;
                            TELEGRAM_NON_TRANSIENT_DELAY
                        }
                    };
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates failed; keeping poll loop alive"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_inbound_update(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient(error: &ChannelError) -> bool {
    match error {
        ChannelError::Http(_) | ChannelError::ResponseFormat(_) => true,
        ChannelError::Api { code, .. } => *code == 408 || *code >= 500,
        ChannelError::RetryAfter(_) => true,
    }
}

/// Decode a Bot API reply. A `parameters.retry_after` hint becomes
/// [`ChannelError::RetryAfter`] whatever the status code says.
fn decode_response<R: DeserializeOwned>(status: u16, body: &str) -> Result<R> {
    let envelope: TelegramEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if !(200..300).contains(&status) => {
            return Err(ChannelError::Api {
                code: status,
                description: body.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(retry_after) = envelope.parameters.as_ref().and_then(|p| p.retry_after) {
        return Err(ChannelError::RetryAfter(Duration::from_secs(retry_after)));
    }
    if !envelope.ok {
        return Err(ChannelError::Api {
            code: envelope.error_code.unwrap_or(status),
            description: envelope.description.unwrap_or_default(),
        });
    }
    let result = envelope
        .result
        .ok_or_else(|| ChannelError::ResponseFormat("ok response without result".into()))?;
    Ok(serde_json::from_value(result)?)
}

fn build_inbound_update(update: &TelegramUpdate) -> Option<InboundUpdate> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let content = extract_message_content(message)?;

    Some(InboundUpdate {
        update_id: update.update_id,
        message_id: message.message_id.map(|id| MessageId::new(id.to_string())),
        chat_id: ChatId::new(chat.id.to_string()),
        sender_id: message.from.as_ref().map(|user| UserId::new(user.id.to_string())),
        is_group: chat.r#type != "private",
        content,
        received_at: Utc::now(),
    })
}

fn extract_message_content(message: &TelegramMessage) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if message.has_non_text_payload() {
        return Some(TELEGRAM_NON_TEXT_PLACEHOLDER.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<Value>,
    #[serde(default)]
    sticker: Option<Value>,
    #[serde(default)]
    document: Option<Value>,
    #[serde(default)]
    voice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.document.is_some()
            || self.voice.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn flood_control_reply_carries_retry_after() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        let err = decode_response::<Value>(429, body).expect_err("throttled");
        assert!(matches!(err, ChannelError::RetryAfter(d) if d == Duration::from_secs(7)));
    }

    #[test]
    fn api_errors_keep_code_and_description() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        match decode_response::<Value>(400, body).expect_err("bad request") {
            ChannelError::Api { code, description } => {
                assert_eq!(code, 400);
                assert!(description.contains("chat not found"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = decode_response::<Value>(502, "<html>bad gateway</html>").expect_err("gateway");
        assert!(matches!(err, ChannelError::Api { code: 502, .. }));
        assert!(is_transient(&err));
    }

    #[test]
    fn ok_reply_decodes_result() {
        let body = r#"{"ok":true,"result":[{"update_id":5,"message":{"message_id":1,"chat":{"id":-100,"type":"supergroup"},"from":{"id":9},"text":" hi "}}]}"#;
        let updates: Vec<TelegramUpdate> = decode_response(200, body).expect("decoded");
        let inbound = build_inbound_update(&updates[0]).expect("text message");
        assert_eq!(inbound.update_id, 5);
        assert_eq!(inbound.chat_id.as_str(), "-100");
        assert_eq!(inbound.sender_id.as_ref().map(UserId::as_str), Some("9"));
        assert!(inbound.is_group);
        assert_eq!(inbound.content, "hi");
    }

    #[test]
    fn message_content_prefers_text_then_caption_then_non_text_placeholder() {
        let mut message = TelegramMessage {
            text: Some(" hello ".to_string()),
            caption: Some("caption".to_string()),
            ..TelegramMessage::default()
        };
        assert_eq!(extract_message_content(&message).as_deref(), Some("hello"));

        message.text = None;
        assert_eq!(extract_message_content(&message).as_deref(), Some("caption"));

        message.caption = None;
        assert_eq!(extract_message_content(&message), None);

        message.photo = vec![json!({"file_id": "abc"})];
        assert_eq!(
            extract_message_content(&message).as_deref(),
            Some(TELEGRAM_NON_TEXT_PLACEHOLDER)
        );
    }

    #[test]
    fn updates_without_chat_are_skipped() {
        let update = TelegramUpdate {
            update_id: 1,
            message: Some(TelegramMessage {
                text: Some("orphan".into()),
                ..TelegramMessage::default()
            }),
        };
        assert!(build_inbound_update(&update).is_none());
    }
}
