use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::ManagedResource;

/// Receives a notification whenever a resource becomes hard-broken
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify_broken(&self, resource: &ManagedResource) -> anyhow::Result<()>;
}

/// Only writes the alert to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify_broken(&self, resource: &ManagedResource) -> anyhow::Result<()> {
        warn!(
            "resource {} ({}) is broken: {}",
            resource.id,
            resource.resource_type,
            resource.last_error.as_deref().unwrap_or("unknown error")
        );
        Ok(())
    }
}

/// Posts a JSON alert to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    fn format_message(resource: &ManagedResource) -> String {
        format!(
            "🔴 **Connection broken**: `{}` ({}) needs new credentials: {}",
            resource.id,
            resource.resource_type,
            resource.last_error.as_deref().unwrap_or("authorization failed")
        )
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    #[instrument(skip(self, resource), fields(resource = %resource.id))]
    async fn notify_broken(&self, resource: &ManagedResource) -> anyhow::Result<()> {
        let payload = json!({
            "message": Self::format_message(resource),
            "resource": resource.id,
            "resource_type": resource.resource_type,
            "error": resource.last_error,
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("sent broken-resource webhook alert");
                Ok(())
            }
            Ok(response) => {
                error!("webhook alert failed with status: {}", response.status());
                anyhow::bail!("webhook returned {}", response.status())
            }
            Err(e) => {
                error!("failed to send webhook alert: {e}");
                Err(e.into())
            }
        }
    }
}
