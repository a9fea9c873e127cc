use crate::config::toml_config::NotificationConfig;
use crate::domain::model::Notification;
use crate::domain::ports::Notifier;
use crate::utils::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Posts each notification as JSON to a configured webhook.
pub struct WebhookNotifier {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            timeout,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        config.webhook_url.as_ref().map(|url| {
            Self::new(
                url.clone(),
                Duration::from_secs(config.timeout_seconds.unwrap_or(10)),
            )
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        tracing::debug!("📨 Posting notification for {} to {}", notification.member_id, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(notification)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::DeliveryError {
                message: format!("Webhook responded with status: {}", response.status()),
            })
        }
    }
}

/// Writes notifications to the log only; used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            member_id = %notification.member_id,
            kind = ?notification.kind,
            "🔔 Notification dispatched"
        );
        Ok(())
    }
}
