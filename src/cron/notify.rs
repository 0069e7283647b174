//! Operator notifications for stalled jobs

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> SyncResult<()>;
}

/// Emits notifications as `tracing` errors only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> SyncResult<()> {
        tracing::error!("📣 {}: {}", subject, body);
        Ok(())
    }
}

/// POSTs `{"subject", "body", "sent_at"}` to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::config(format!("Notifier HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) -> SyncResult<()> {
        let payload = json!({
            "subject": subject,
            "body": body,
            "sent_at": chrono::Utc::now().to_rfc3339(),
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SyncError::sync(format!("Notification to {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(SyncError::sync(format!(
                "Notification to {} answered HTTP {}",
                self.url,
                response.status()
            )));
        }
        tracing::info!("📣 Operator notified: {}", subject);
        Ok(())
    }
}
