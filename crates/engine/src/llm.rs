//! LLM collaborator for agent-driven routing.
//!
//! The router only needs one capability: given a routing prompt, return the
//! slug of the operation to invoke. [`OperationPicker`] abstracts that;
//! [`AnthropicPicker`] is the production implementation backed by the
//! Anthropic Messages API.

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

/// Anthropic Messages API endpoint.
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 256;

/// Picks one operation slug for a routing prompt.
#[async_trait]
pub trait OperationPicker: Send + Sync {
    /// Returns the chosen slug. The caller validates it against the tool's
    /// operations; anything unknown becomes a routing failure.
    async fn pick_operation(&self, prompt: &str) -> Result<String>;
}

/// Configuration for the Anthropic-backed picker.
#[derive(Debug, Clone)]
pub struct AnthropicPickerConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Timeout for the routing call, independent of the action call that
    /// follows it.
    pub timeout: Duration,
}

impl Default for AnthropicPickerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Production picker calling the Anthropic Messages API.
pub struct AnthropicPicker {
    client: Client,
    api_key: String,
    config: AnthropicPickerConfig,
}

impl AnthropicPicker {
    /// Creates a picker with an explicit API key.
    pub fn new(api_key: String, config: AnthropicPickerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| anyhow!("failed to create HTTP client: {error}"))?;
        Ok(Self { client, api_key, config })
    }

    /// Creates a picker reading `ANTHROPIC_API_KEY` from the environment.
    pub fn from_env(config: AnthropicPickerConfig) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| anyhow!("ANTHROPIC_API_KEY not set"))?;
        Self::new(api_key, config)
    }

    fn build_request(&self, prompt: &str) -> Value {
        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": "You are a routing assistant. Reply with exactly one operation slug from the list, nothing else.",
            "messages": [{"role": "user", "content": prompt}],
        })
    }

    fn parse_response(body: &Value) -> Result<String> {
        let text = body["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|block| block["type"] == "text")
                    .and_then(|block| block["text"].as_str())
            })
            .ok_or_else(|| anyhow!("routing response contained no text block"))?;
        let slug = text.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
        if slug.is_empty() {
            return Err(anyhow!("routing response was empty"));
        }
        Ok(slug.to_string())
    }
}

#[async_trait]
impl OperationPicker for AnthropicPicker {
    async fn pick_operation(&self, prompt: &str) -> Result<String> {
        debug!(model = %self.config.model, "requesting routing decision");
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_request(prompt))
            .send()
            .await
            .map_err(|error| anyhow!("routing request failed: {error}"))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|error| anyhow!("routing response was not JSON: {error}"))?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(anyhow!("routing request returned {status}: {message}"));
        }
        Self::parse_response(&body)
    }
}
