//! Alert dispatcher.
//!
//! Publishes one message per job that kept at least one frame. Publishing is
//! best effort: the outcome is recorded, never propagated as an error.

use crate::job::Job;
use crate::object_store::{ObjectLocator, ObjectStore};
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// SNS caps subjects at 100 characters.
pub const MAX_SUBJECT_CHARS: usize = 100;

/// Errors from the notification channel.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Notification transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish `body` to `destination`, returning the transport's message id.
    async fn publish(&self, destination: &str, subject: &str, body: &str) -> Result<String, NotifyError>;
}

/// What happened to a job's alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AlertOutcome {
    /// Nothing was retained
    Skipped,
    /// No notification destination configured
    Disabled,
    Published { message_id: String },
    Failed { error: String },
}

/// Alert body.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub job_id: Uuid,
    pub source_locator: ObjectLocator,
    pub retained_refs: Vec<ObjectLocator>,
    pub access_urls: Vec<String>,
}

/// Builds and sends the per-job alert.
pub struct AlertDispatcher {
    notifier: Option<Arc<dyn Notifier>>,
    store: Arc<dyn ObjectStore>,
    topic: Option<String>,
    subject_prefix: String,
    url_ttl: Duration,
}

impl AlertDispatcher {
    pub fn new(
        notifier: Option<Arc<dyn Notifier>>,
        store: Arc<dyn ObjectStore>,
        topic: Option<String>,
        subject_prefix: impl Into<String>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            notifier,
            store,
            topic,
            subject_prefix: subject_prefix.into(),
            url_ttl,
        }
    }

    #[instrument(skip(self, job, retained), fields(job_id = %job.job_id, retained = retained.len()))]
    pub async fn dispatch(&self, job: &Job, retained: &[ObjectLocator]) -> AlertOutcome {
        if retained.is_empty() {
            return AlertOutcome::Skipped;
        }

        let (notifier, topic) = match (&self.notifier, &self.topic) {
            (Some(n), Some(t)) => (n, t),
            _ => {
                info!("No notification topic configured, alert not sent");
                return AlertOutcome::Disabled;
            }
        };

        let mut access_urls = Vec::with_capacity(retained.len());
        for object in retained {
            match self.store.presign(object, self.url_ttl).await {
                Ok(url) => access_urls.push(url),
                Err(e) => {
                    warn!(key = %object.key, error = %e, "Presign failed, using object reference");
                    access_urls.push(object.to_string());
                }
            }
        }

        let message = AlertMessage {
            job_id: job.job_id,
            source_locator: job.source.clone(),
            retained_refs: retained.to_vec(),
            access_urls,
        };
        let subject = alert_subject(&self.subject_prefix, job.source.file_name());

        let published = match serde_json::to_string(&message) {
            Ok(body) => notifier.publish(topic, &subject, &body).await,
            Err(e) => Err(NotifyError::from(e)),
        };

        match published {
            Ok(message_id) => {
                metrics::counter!("vigil.alerts.published").increment(1);
                info!(message_id = %message_id, "Alert published");
                AlertOutcome::Published { message_id }
            }
            Err(e) => {
                metrics::counter!("vigil.alerts.failed").increment(1);
                warn!(error = %e, "Alert publish failed");
                AlertOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// `"{prefix} in {file_name}"`, cut to [`MAX_SUBJECT_CHARS`].
pub fn alert_subject(prefix: &str, file_name: &str) -> String {
    format!("{} in {}", prefix, file_name)
        .chars()
        .take(MAX_SUBJECT_CHARS)
        .collect()
}

/// [`Notifier`] backed by an SNS topic.
pub struct SnsNotifier {
    client: aws_sdk_sns::Client,
}

impl SnsNotifier {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_sns::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl Notifier for SnsNotifier {
    async fn publish(&self, destination: &str, subject: &str, body: &str) -> Result<String, NotifyError> {
        let output = self
            .client
            .publish()
            .topic_arn(destination)
            .subject(subject)
            .message(body)
            .send()
            .await
            .map_err(|e| NotifyError::Publish(DisplayErrorContext(&e).to_string()))?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }
}
