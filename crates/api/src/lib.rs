//! Integration HTTP client.
//!
//! This crate provides a thin, preconfigured `reqwest` wrapper for calling a
//! tenant's registered integrations:
//!
//! - Constructing an HTTP client with sensible defaults and a per-call timeout
//! - Validating integration base URLs for safety
//! - Building requests with a consistent User-Agent and Accept header
//! - Signing requests through a single dispatch over the closed
//!   [`AuthScheme`](conduit_types::AuthScheme) set
//!
//! The primary entry point is [`IntegrationClient`]. Create an instance via
//! [`IntegrationClient::new`], build requests with
//! [`IntegrationClient::request`], and attach credentials with [`sign`].

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use conduit_types::{ApiKeyPlacement, AuthScheme, Credential};
use reqwest::{Client, RequestBuilder, Url, header};
use tracing::debug;

/// Hostnames allowed for local development regardless of scheme.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Placeholder replaced with the credential secret inside custom header
/// values.
const SECRET_PLACEHOLDER: &str = "{{secret}}";

/// Thin wrapper around a configured `reqwest::Client` for one integration.
///
/// The client pre-configures default headers and builds requests against a
/// validated base URL. Authentication is applied per request by [`sign`],
/// never baked into the client, so one client can serve credentials from
/// different connections.
#[derive(Debug, Clone)]
pub struct IntegrationClient {
    pub base_url: String,
    pub http: Client,
    pub user_agent: String,
}

impl IntegrationClient {
    /// Constructs a client for an integration base URL.
    ///
    /// Non-localhost hosts must use HTTPS; localhost is allowed with any
    /// scheme for development.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        validate_base_url(base_url)?;

        let mut default_headers = header::HeaderMap::new();
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .context("build http client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            user_agent: format!("conduit-engine/0.1; {}", std::env::consts::OS),
        })
    }

    /// Builds a `reqwest::RequestBuilder` for a method and API-relative path.
    pub fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "building request");

        self.http.request(method, url).header(header::USER_AGENT, &self.user_agent)
    }
}

/// Applies an integration's auth scheme to an outgoing request.
///
/// This is the single place credentials touch a request. The match is
/// deliberately exhaustive: a new [`AuthScheme`] variant will not compile
/// until its signing behavior is decided here.
pub fn sign(builder: RequestBuilder, auth: &AuthScheme, credential: &Credential) -> Result<RequestBuilder> {
    let signed = match auth {
        AuthScheme::OauthBearer | AuthScheme::Bearer => {
            builder.header(header::AUTHORIZATION, format!("Bearer {}", credential.secret))
        }
        AuthScheme::Basic => builder.basic_auth(
            credential.username.clone().unwrap_or_default(),
            Some(credential.secret.clone()),
        ),
        AuthScheme::ApiKey { placement, name } => match placement {
            ApiKeyPlacement::Header => builder.header(name.as_str(), credential.secret.as_str()),
            ApiKeyPlacement::Query => builder.query(&[(name.as_str(), credential.secret.as_str())]),
        },
        AuthScheme::CustomHeaders { headers } => {
            let mut signed = builder;
            for (name, value) in headers {
                let value = value.replace(SECRET_PLACEHOLDER, &credential.secret);
                signed = signed.header(name.as_str(), value);
            }
            signed
        }
    };
    Ok(signed)
}

/// Validates that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS
fn validate_base_url(base: &str) -> Result<()> {
    let parsed = Url::parse(base).map_err(|e| anyhow!("invalid integration base URL '{}': {}", base, e))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("integration base URL must include a host"))?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host.eq_ignore_ascii_case(allowed)) {
        return Ok(());
    }

    if parsed.scheme() != "https" {
        return Err(anyhow!(
            "integration base URL must use https for non-localhost hosts; got '{}://'",
            parsed.scheme()
        ));
    }

    Ok(())
}
