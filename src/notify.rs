//! Notifications
//!
//! Delivery transports are external collaborators; the core only depends on
//! this seam. A Gotify-style HTTP sender is provided, with a log-only
//! fallback when no URL is configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::config::NotifyConfig;

pub const PRIORITY_LOW: u8 = 2;
pub const PRIORITY_MEDIUM: u8 = 5;
pub const PRIORITY_HIGH: u8 = 8;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, title: &str, message: &str, priority: u8) -> Result<()>;
}

/// Writes notifications to the log only. Used when no transport is
/// configured, and in tests.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, title: &str, message: &str, priority: u8) -> Result<()> {
        info!("notification [p{}] {}: {}", priority, title, message);
        Ok(())
    }
}

/// Gotify-compatible HTTP notifier.
pub struct GotifyNotifier {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl GotifyNotifier {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Notifier for GotifyNotifier {
    async fn send(&self, title: &str, message: &str, priority: u8) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/message", self.url))
            .query(&[("token", self.token.as_str())])
            .json(&json!({
                "title": title,
                "message": message,
                "priority": priority,
            }))
            .send()
            .await
            .context("notification request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("notification rejected with status {}", response.status());
        }
        Ok(())
    }
}

/// Pick a notifier from configuration.
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    match (&config.url, &config.token) {
        (Some(url), Some(token)) => Box::new(GotifyNotifier::new(url.clone(), token.clone())),
        _ => Box::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.send("title", "message", PRIORITY_LOW).await.is_ok());
    }

    #[test]
    fn test_from_config_falls_back_to_log() {
        let notifier = from_config(&NotifyConfig::default());
        // Log-only notifier; nothing to assert beyond construction.
        let _ = notifier;
    }
}
