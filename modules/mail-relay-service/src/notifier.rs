//! Outbound chat notifications.
//!
//! Delivery is best effort: failures are logged by [`fan_out`] and never
//! reach the relay run.

use crate::error::{ApiError, NotifyError};
use crate::http::truncate_error;
use crate::secrets::{self, SecretStore};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;

/// Telegram rejects messages longer than this
const TELEGRAM_MAX_LEN: usize = 4096;

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Send `text` to every notifier; returns how many accepted it
pub async fn fan_out(notifiers: &[Arc<dyn Notifier>], text: &str) -> usize {
    let mut delivered = 0usize;
    for notifier in notifiers {
        match notifier.send(text).await {
            Ok(()) => delivered += 1,
            Err(e) => log::warn!("[MAIL_RELAY] {}", e),
        }
    }
    delivered
}

/// Build the notifiers whose secrets are configured
pub fn from_secrets(http: &Client, store: &dyn SecretStore) -> Vec<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();

    if let (Some(token), Some(chat_id)) = (
        store.get(secrets::TELEGRAM_BOT_TOKEN),
        store.get(secrets::TELEGRAM_CHAT_ID),
    ) {
        notifiers.push(Arc::new(TelegramNotifier::new(http.clone(), token, chat_id)));
    }

    if let Some(webhook_url) = store.get(secrets::SLACK_WEBHOOK_URL) {
        notifiers.push(Arc::new(SlackNotifier::new(http.clone(), webhook_url)));
    }

    notifiers
}

/// Split a message into chunks respecting a platform's character limit.
/// Splits on line boundaries; lines exceeding `max_len` are hard-split on char boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in text.lines() {
        let line_len = line.chars().count();
        if current_len + line_len + 1 > max_len {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if line_len > max_len {
                let chars: Vec<char> = line.chars().collect();
                let mut pieces = chars.chunks(max_len).peekable();
                while let Some(piece) = pieces.next() {
                    if pieces.peek().is_some() {
                        chunks.push(piece.iter().collect());
                    } else {
                        current = piece.iter().collect();
                        current_len = piece.len();
                    }
                }
            } else {
                current = line.to_string();
                current_len = line_len;
            }
        } else {
            if !current.is_empty() {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(line);
            current_len += line_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

// =====================================================
// Telegram
// =====================================================

pub struct TelegramNotifier {
    http: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(http: Client, bot_token: String, chat_id: String) -> Self {
        Self {
            http,
            bot_token,
            chat_id,
        }
    }

    async fn send_chunk(&self, text: &str) -> Result<(), ApiError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            // reqwest errors include the URL, which carries the bot token
            .map_err(|e| ApiError::new(format!("Telegram request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::with_status(
                format!("Telegram API error: {}", truncate_error(&body)),
                status.as_u16(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        for chunk in split_message(text, TELEGRAM_MAX_LEN) {
            self.send_chunk(&chunk).await.map_err(|source| NotifyError {
                target: self.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

// =====================================================
// Slack
// =====================================================

/// Slack incoming webhook
pub struct SlackNotifier {
    http: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(http: Client, webhook_url: String) -> Self {
        Self { http, webhook_url }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let to_notify_error = |source| NotifyError {
            target: "slack".to_string(),
            source,
        };

        let response = self
            .http
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| to_notify_error(ApiError::new(format!(
                "Slack request failed: {}",
                e.without_url()
            ))))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(to_notify_error(ApiError::with_status(
                format!("Slack webhook error: {}", truncate_error(&body)),
                status.as_u16(),
            )));
        }
        Ok(())
    }
}
