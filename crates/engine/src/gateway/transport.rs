//! Upstream HTTP execution behind a trait, so the gateway's control flow
//! (breaker, retries, envelope mapping) is testable without a network.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use conduit_api::{IntegrationClient, sign};
use conduit_types::{Credential, Integration};
use conduit_util::redact_sensitive;
use indexmap::IndexMap;
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// A fully resolved request, ready to sign and send.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    /// HTTP method, uppercase.
    pub method: String,
    /// Resolved path relative to the integration base URL.
    pub path: String,
    /// Resolved query parameters.
    pub query: Vec<(String, String)>,
    /// Resolved extra headers.
    pub headers: IndexMap<String, String>,
    /// Resolved JSON body, when the method carries one.
    pub body: Option<Value>,
    /// Per-call timeout.
    pub timeout: Duration,
}

/// Raw upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

/// Transport-level failure, classified for retry decisions.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("could not build request: {0}")]
    Build(String),
}

impl TransportError {
    /// Transient failures are retried; build failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Network(_))
    }
}

/// Sends prepared calls to an integration.
#[async_trait]
pub trait ActionTransport: Send + Sync {
    async fn send(
        &self,
        integration: &Integration,
        credential: &Credential,
        call: &PreparedCall,
    ) -> Result<UpstreamResponse, TransportError>;
}

/// Production transport backed by [`IntegrationClient`].
#[derive(Debug, Default)]
pub struct HttpTransport;

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn send(
        &self,
        integration: &Integration,
        credential: &Credential,
        call: &PreparedCall,
    ) -> Result<UpstreamResponse, TransportError> {
        let client = IntegrationClient::new(&integration.base_url, call.timeout)
            .map_err(|error| TransportError::Build(error.to_string()))?;
        let method = Method::from_str(&call.method).map_err(|error| TransportError::Build(error.to_string()))?;

        let mut builder = client.request(method.clone(), &call.path);
        if !call.query.is_empty() {
            builder = builder.query(&call.query);
        }
        for (name, value) in &call.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &call.body
            && method != Method::GET
            && method != Method::DELETE
        {
            builder = builder.json(body);
        }
        let builder = sign(builder, &integration.auth, credential)
            .map_err(|error| TransportError::Build(error.to_string()))?;

        debug!(
            integration = %integration.slug,
            method = %method,
            path = %call.path,
            "sending upstream request"
        );

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(redact_sensitive(&error.to_string()))
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 400 {
            warn!(
                integration = %integration.slug,
                path = %call.path,
                status,
                "upstream request failed"
            );
        }
        Ok(UpstreamResponse { status, body })
    }
}
