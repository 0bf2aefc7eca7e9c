//! Notification sink.
//!
//! Delivery is best effort. A sink never returns an error to the caller; a
//! failed send is logged and dropped.

use crate::config::NotifyConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Success,
    Failure,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationStatus::Success => f.write_str("SUCCESS"),
            NotificationStatus::Failure => f.write_str("FAILURE"),
        }
    }
}

/// Terminal status of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub status: NotificationStatus,
    /// `backup` or `restore`
    pub operation: String,
    pub duration: Duration,
    pub artifact: Option<String>,
    pub detail: String,
}

impl NotificationEvent {
    pub fn success(operation: &str, duration: Duration, artifact: Option<String>, detail: String) -> Self {
        Self {
            status: NotificationStatus::Success,
            operation: operation.to_string(),
            duration,
            artifact,
            detail,
        }
    }

    pub fn failure(operation: &str, duration: Duration, artifact: Option<String>, detail: String) -> Self {
        Self {
            status: NotificationStatus::Failure,
            operation: operation.to_string(),
            duration,
            artifact,
            detail,
        }
    }

    pub fn render(&self, host: &str) -> String {
        let mut text = format!(
            "{} {} on {} ({}s)",
            self.operation,
            self.status,
            host,
            self.duration.as_secs()
        );
        if let Some(artifact) = &self.artifact {
            text.push_str(&format!("\nArtifact: {}", artifact));
        }
        if !self.detail.is_empty() {
            text.push('\n');
            text.push_str(&self.detail);
        }
        text
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn report(&self, event: &NotificationEvent);
}

/// Used when no channel is configured; the event only reaches the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn report(&self, event: &NotificationEvent) {
        match event.status {
            NotificationStatus::Success => info!("{}", event.render(&local_host())),
            NotificationStatus::Failure => warn!("{}", event.render(&local_host())),
        }
    }
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &NotifyConfig) -> Self {
        Self::with_base_url(config, TELEGRAM_API)
    }

    pub fn with_base_url(config: &NotifyConfig, base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: format!("{}/bot{}/sendMessage", base_url.trim_end_matches('/'), config.bot_token),
            chat_id: config.chat_id.clone(),
        }
    }
}

impl TelegramNotifier {
    /// Post one message. Error text never carries the request URL, which
    /// embeds the bot token.
    async fn send(&self, event: &NotificationEvent) -> std::result::Result<(), String> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": event.render(&local_host()),
            "disable_web_page_preview": true,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("delivery failed: {}", e.without_url()))?;
        if !resp.status().is_success() {
            return Err(format!("rejected with status {}", resp.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn report(&self, event: &NotificationEvent) {
        match self.send(event).await {
            Ok(()) => info!("Notification sent ({} {})", event.operation, event.status),
            Err(e) => warn!("Notification {}", e),
        }
    }
}

/// Telegram when configured, log-only otherwise.
pub fn from_config(config: Option<&NotifyConfig>) -> Arc<dyn Notifier> {
    match config {
        Some(notify) => Arc::new(TelegramNotifier::new(notify)),
        None => Arc::new(LogNotifier),
    }
}

fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
