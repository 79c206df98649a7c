//! Notification sinks.
//!
//! Stateless event listeners. The log notifier is always installed; the
//! Telegram notifier is opt-in and configured from the environment.
//! Delivery failures are logged by the bus and never interrupt the
//! handler chain.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::env;

use crate::bus::{Event, EventListener};

/// Human-readable message for an event, shared by all sinks.
pub fn describe_event(event: &Event) -> String {
    match event {
        Event::CheckFailed { check, result } => {
            let timestamp = DateTime::<Utc>::from_timestamp(result.created_at, 0)
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%dT%H:%M:%SZ");
            format!(
                "Check failed: {} ({} check on {}) at {}: {}",
                check.name, check.kind, check.target, timestamp, result.payload
            )
        }
        Event::ServiceStatusChanged { service, status } => {
            format!("Service '{}' is now {}", service.name, status)
        }
    }
}

/// Notifier that writes transitions to the log stream.
pub struct LogNotifier;

#[async_trait]
impl EventListener for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::CheckFailed { .. } => tracing::warn!("{}", describe_event(event)),
            Event::ServiceStatusChanged { .. } => tracing::info!("{}", describe_event(event)),
        }
        Ok(())
    }
}

/// Notifier that posts transitions to a Telegram chat via the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Build from `TELEGRAM_BOT_TOKEN` and `TELEGRAM_CHAT_ID`.
    pub fn from_env() -> anyhow::Result<Self> {
        let token = match env::var("TELEGRAM_BOT_TOKEN") {
            Ok(token) if !token.is_empty() => token,
            _ => bail!("TELEGRAM_BOT_TOKEN is required for telegram notifications"),
        };
        let chat_id = match env::var("TELEGRAM_CHAT_ID") {
            Ok(chat_id) if !chat_id.is_empty() => chat_id,
            _ => bail!("TELEGRAM_CHAT_ID is required for telegram notifications"),
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build telegram HTTP client")?;
        Ok(Self {
            client,
            token,
            chat_id,
        })
    }

    async fn send(&self, text: &str) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        self.client
            .post(&url)
            .json(&json!({"chat_id": self.chat_id, "text": text}))
            .send()
            .await
            .context("telegram request failed")?
            .error_for_status()
            .context("telegram rejected the message")?;
        Ok(())
    }
}

#[async_trait]
impl EventListener for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.send(&describe_event(event)).await
    }
}
