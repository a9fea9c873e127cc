//! Delivery of side effects committed as outbox tasks.

use crate::config::toml_config::{EngineConfig, OutboxConfig};
use crate::domain::model::{OutboxPayload, OutboxStatus, OutboxTask};
use crate::domain::ports::{DocumentStore, Notifier};
use crate::utils::error::Result;
use crate::utils::retry::{retry_with_backoff, RetryConfig};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Still pending, will be picked up by the next drain.
    pub deferred: usize,
    /// Gave up after the configured number of drains.
    pub failed: usize,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.delivered + self.deferred + self.failed == 0
    }
}

pub struct OutboxDispatcher<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    config: OutboxConfig,
    delivery_retry: RetryConfig,
}

impl<S: DocumentStore + ?Sized + 'static> OutboxDispatcher<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>, config: &EngineConfig) -> Self {
        Self {
            store,
            notifier,
            config: config.outbox.clone(),
            delivery_retry: config.outbox.delivery_retry_config(),
        }
    }

    pub fn with_delivery_retry(mut self, retry: RetryConfig) -> Self {
        self.delivery_retry = retry;
        self
    }

    /// Deliver one batch of pending tasks, oldest first.
    pub async fn drain(&self) -> Result<DispatchReport> {
        let tasks = self.store.pending_outbox(self.config.batch_size).await?;
        let mut report = DispatchReport::default();

        for mut task in tasks {
            let outcome = self.deliver(&task).await;
            task.attempts += 1;

            match outcome {
                Ok(()) => {
                    task.status = OutboxStatus::Delivered;
                    task.last_error = None;
                    report.delivered += 1;
                }
                Err(e) if task.attempts >= self.config.max_attempts => {
                    tracing::error!("❌ Outbox task {} failed permanently: {}", task.id, e);
                    task.status = OutboxStatus::Failed;
                    task.last_error = Some(e.to_string());
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Outbox task {} failed (attempt {}/{}): {}",
                        task.id,
                        task.attempts,
                        self.config.max_attempts,
                        e
                    );
                    task.last_error = Some(e.to_string());
                    report.deferred += 1;
                }
            }

            let task_id = task.id.clone();
            if let Err(e) = self.store.update_outbox(task).await {
                tracing::warn!("⚠️ Failed to record outbox state for {}: {}", task_id, e);
            }
        }

        if !report.is_empty() {
            tracing::info!(
                "📬 Outbox drained: delivered={}, deferred={}, failed={}",
                report.delivered,
                report.deferred,
                report.failed
            );
        }
        Ok(report)
    }

    async fn deliver(&self, task: &OutboxTask) -> Result<()> {
        match &task.payload {
            OutboxPayload::Notification(notification) => {
                retry_with_backoff(&self.delivery_retry, "notification delivery", || {
                    self.notifier.notify(notification)
                })
                .await
            }
            OutboxPayload::Analytics(event) => {
                retry_with_backoff(&self.delivery_retry, "analytics write", || {
                    self.store.append_analytics_event(event.clone())
                })
                .await
            }
        }
    }

    /// Drain repeatedly on the tokio runtime until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.poll_interval();
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.drain().await {
                    tracing::error!("❌ Outbox drain failed: {}", e);
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}
