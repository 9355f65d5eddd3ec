//! Backend probe, bearer tokens and the cross-transport health report

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::error::{RealtimeError, RealtimeResult};

/// Pre-flight check run before any pooled connection is attempted
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> RealtimeResult<()>;
}

/// `GET {api}/health`, expecting a 2xx JSON body
pub struct HttpHealthProbe {
    client: Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(api_base_url: &str, timeout: Duration) -> RealtimeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RealtimeError::Http(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/health", api_base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> RealtimeResult<()> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                RealtimeError::BackendUnavailable("health probe timed out".to_string())
            } else {
                RealtimeError::BackendUnavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RealtimeError::BackendUnavailable(format!(
                "health probe returned HTTP {}",
                status.as_u16()
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map(|_| ())
            .map_err(|e| RealtimeError::BackendUnavailable(format!("health body is not JSON: {}", e)))
    }
}

/// "Give me a bearer token"
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token (or none)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Cross-transport health. Up if any one transport is up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub websocket: bool,
    pub subscriptions: bool,
    pub sse: bool,
    pub overall: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_flags(websocket: bool, subscriptions: bool, sse: bool) -> Self {
        Self {
            websocket,
            subscriptions,
            sse,
            overall: websocket || subscriptions || sse,
            checked_at: Utc::now(),
        }
    }
}
