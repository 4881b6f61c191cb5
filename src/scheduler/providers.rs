//! Provider lookup table and refresh executors
//!
//! Every resource type maps to one [`Provider`]: its polling interval,
//! whether it pushes updates itself, and the executor that performs a
//! refresh.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, trace};

use crate::ManagedResource;
use crate::config::{ProviderConfig, RefreshConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// Credentials were rejected; the resource is marked broken
    Auth(String),

    Other(String),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::Auth(msg) => write!(f, "authorization failed: {msg}"),
            RefreshError::Other(msg) => write!(f, "refresh failed: {msg}"),
        }
    }
}

impl std::error::Error for RefreshError {}

#[async_trait]
pub trait RefreshExecutor: Send + Sync {
    async fn refresh(&self, resource: &ManagedResource) -> Result<(), RefreshError>;
}

/// Executor for providers whose refresh has nothing to do
#[derive(Debug, Clone, Default)]
pub struct NoopRefreshExecutor;

#[async_trait]
impl RefreshExecutor for NoopRefreshExecutor {
    async fn refresh(&self, resource: &ManagedResource) -> Result<(), RefreshError> {
        trace!("no-op refresh of {}", resource.id);
        Ok(())
    }
}

/// Refreshes a resource with `GET {base_url}/{resource_id}`
#[derive(Debug, Clone)]
pub struct HttpRefreshExecutor {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRefreshExecutor {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl RefreshExecutor for HttpRefreshExecutor {
    #[instrument(skip(self, resource), fields(resource = %resource.id))]
    async fn refresh(&self, resource: &ManagedResource) -> Result<(), RefreshError> {
        let url = format!("{}/{}", self.base_url, resource.id);
        trace!("requesting refresh from {url}");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RefreshError::Other(format!("request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(RefreshError::Auth(format!("provider answered {status}")))
            }
            status => Err(RefreshError::Other(format!("provider answered {status}"))),
        }
    }
}

#[derive(Clone)]
pub struct Provider {
    pub interval: chrono::Duration,

    /// Push-based providers are never polled
    pub push: bool,

    pub executor: Arc<dyn RefreshExecutor>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("interval", &self.interval)
            .field("push", &self.push)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[ProviderConfig]) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let executor: Arc<dyn RefreshExecutor> = match &config.refresh {
                RefreshConfig::Noop => Arc::new(NoopRefreshExecutor),
                RefreshConfig::Http {
                    base_url,
                    token,
                    timeout_secs,
                } => Arc::new(HttpRefreshExecutor::new(
                    base_url,
                    token.clone(),
                    Duration::from_secs(*timeout_secs),
                )?),
            };
            debug!(
                "registering provider {} (interval {}s, push: {})",
                config.resource_type, config.interval_secs, config.push
            );
            registry.register(
                &config.resource_type,
                Provider {
                    interval: crate::util::secs(config.interval_secs),
                    push: config.push,
                    executor,
                },
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, resource_type: impl Into<String>, provider: Provider) {
        self.providers.insert(resource_type.into(), provider);
    }

    pub fn get(&self, resource_type: &str) -> Option<&Provider> {
        self.providers.get(resource_type)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
