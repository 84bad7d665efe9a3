//! Action gateway: turns one action invocation into an authenticated,
//! resilient upstream call.
//!
//! - Catalog and credential lookups go through the collaborator traits
//! - Templated path/header/query/body fields resolve through the
//!   [`VariableResolver`]
//! - A keyed circuit breaker fails fast while an integration is unhealthy
//! - Transient failures retry with bounded exponential backoff
//! - Every attempt set emits one request log record, fire-and-forget

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_types::{
    ActionSpec, Connection, Credential, ErrorCode, Integration, InvocationError, InvocationMetadata,
    InvocationResult, ReferenceItem, RequestLogEntry,
};
use conduit_util::{build_path, redact_sensitive};
use indexmap::IndexMap;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod breaker;
pub mod retry;
pub mod transport;

pub use breaker::{Admission, BreakerConfig, BreakerKey, CircuitBreakerRegistry, CircuitState};
pub use retry::{RetryPolicy, is_transient_status};
pub use transport::{ActionTransport, HttpTransport, PreparedCall, TransportError, UpstreamResponse};

use crate::clock::Clock;
use crate::resolver::{
    ConnectionInfo, ResolveError, ResolveOptions, RuntimeContext, VariableResolver, mask_sensitive_values,
    template::format_value,
};
use crate::store::{Catalog, CredentialResolver, ExternalUserRef, RequestLogSink};

/// Upstream body snippets attached to error details are capped at this many
/// characters.
const ERROR_BODY_SNIPPET: usize = 512;

/// Gateway tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    /// Timeout for actions that do not declare their own.
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Use this connection's credential and scoped variables.
    pub connection_id: Option<String>,
    /// Reference data for name→id resolution.
    pub reference_context: HashMap<String, Vec<ReferenceItem>>,
    /// Runtime variable overrides forwarded to the resolver.
    pub variables: serde_json::Map<String, Value>,
    /// App issuing end-user-scoped credentials.
    pub app_id: Option<String>,
    /// End user whose credential should be used instead of the tenant's.
    pub external_user_id: Option<String>,
    /// Caller-supplied runtime context.
    pub runtime_context: Option<RuntimeContext>,
    /// Environment tag exposed as `${request.environment}`.
    pub environment: Option<String>,
    /// Correlation id; generated when absent.
    pub request_id: Option<String>,
    /// Overrides the gateway retry policy for this call (pipelines use this
    /// to disable retries on non-retryable steps).
    pub retry: Option<RetryPolicy>,
}

/// The gateway.
pub struct ActionGateway {
    catalog: Arc<dyn Catalog>,
    credentials: Arc<dyn CredentialResolver>,
    resolver: VariableResolver,
    transport: Arc<dyn ActionTransport>,
    log_sink: Arc<dyn RequestLogSink>,
    breakers: CircuitBreakerRegistry,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
}

impl ActionGateway {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        credentials: Arc<dyn CredentialResolver>,
        resolver: VariableResolver,
        transport: Arc<dyn ActionTransport>,
        log_sink: Arc<dyn RequestLogSink>,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Self {
        let breakers = CircuitBreakerRegistry::new(config.breaker, clock.clone());
        Self {
            catalog,
            credentials,
            resolver,
            transport,
            log_sink,
            breakers,
            config,
            clock,
        }
    }

    /// Breaker status for introspection and tests.
    pub fn breaker_state(&self, integration_slug: &str, connection_id: Option<&str>) -> CircuitState {
        self.breakers
            .state(&BreakerKey::new(integration_slug, connection_id.map(Into::into)))
    }

    /// Invokes one action and normalizes the outcome into an envelope.
    pub async fn invoke(
        &self,
        tenant_id: &str,
        integration_slug: &str,
        action_slug: &str,
        params: serde_json::Map<String, Value>,
        options: &InvokeOptions,
    ) -> InvocationResult {
        let request_id = options.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let started = Instant::now();

        match self
            .invoke_inner(tenant_id, integration_slug, action_slug, &params, options, &request_id, started)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                warn!(
                    tenant = %tenant_id,
                    integration = %integration_slug,
                    action = %action_slug,
                    code = %error.code,
                    "action invocation failed"
                );
                InvocationResult::err(
                    error.with_request_id(request_id.clone()),
                    InvocationMetadata {
                        request_id: Some(request_id),
                        latency_ms: Some(elapsed_ms(started)),
                        ..InvocationMetadata::default()
                    },
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke_inner(
        &self,
        tenant_id: &str,
        integration_slug: &str,
        action_slug: &str,
        params: &serde_json::Map<String, Value>,
        options: &InvokeOptions,
        request_id: &str,
        started: Instant,
    ) -> Result<InvocationResult, InvocationError> {
        let (integration, action, connection) = self
            .load_targets(tenant_id, integration_slug, action_slug, options)
            .await?;

        let external_user = match (&options.app_id, &options.external_user_id) {
            (Some(app_id), Some(external_user_id)) => Some(ExternalUserRef {
                app_id: app_id.clone(),
                external_user_id: external_user_id.clone(),
            }),
            _ => None,
        };

        let credential = self
            .credentials
            .resolve(tenant_id, &integration, options.connection_id.as_deref(), external_user.as_ref())
            .await
            .map_err(|error| InvocationError::new(ErrorCode::ContextLoadFailed, format!("credential lookup failed: {error}")))?
            .ok_or_else(|| {
                InvocationError::new(
                    ErrorCode::MissingCredentials,
                    format!("no active credential for integration '{}'", integration.slug),
                )
            })?;

        let resolve_options = self.resolve_options(tenant_id, params, options, connection.as_ref(), request_id);
        let (call, resolved_inputs) = self.prepare_call(&action, params, &resolve_options).await?;

        let breaker_key = BreakerKey::new(integration.slug.clone(), options.connection_id.clone());
        if self.breakers.admit(&breaker_key) == Admission::Rejected {
            return Err(InvocationError::new(
                ErrorCode::CircuitOpen,
                format!("integration '{}' is temporarily unavailable (circuit open)", integration.slug),
            ));
        }

        let retry = options.retry.unwrap_or(self.config.retry);
        let (outcome, attempts) = self.attempt_set(&integration, &credential, &call, retry).await;
        let latency_ms = elapsed_ms(started);

        match outcome {
            Ok(response) if (200..300).contains(&response.status) => {
                self.breakers.record_success(&breaker_key);
                self.record_log(tenant_id, &integration, &action, options, request_id, response.status, true, attempts, latency_ms, None);
                let data = parse_body(&response.body);
                Ok(InvocationResult::ok(
                    data,
                    InvocationMetadata {
                        request_id: Some(request_id.to_string()),
                        latency_ms: Some(latency_ms),
                        resolved_inputs: Some(resolved_inputs),
                        ..InvocationMetadata::default()
                    },
                ))
            }
            Ok(response) => {
                // The integration answered; only 5xx counts against the breaker.
                if is_transient_status(response.status) {
                    self.breakers.record_failure(&breaker_key);
                } else {
                    self.breakers.record_success(&breaker_key);
                }
                self.record_log(
                    tenant_id,
                    &integration,
                    &action,
                    options,
                    request_id,
                    response.status,
                    false,
                    attempts,
                    latency_ms,
                    Some(ErrorCode::ExecutionFailed),
                );
                Err(InvocationError::new(
                    ErrorCode::ExecutionFailed,
                    format!("integration '{}' returned HTTP {}", integration.slug, response.status),
                )
                .with_details(json!({
                    "status": response.status,
                    "body": snippet(&redact_sensitive(&response.body)),
                    "attempts": attempts,
                })))
            }
            Err(TransportError::Build(message)) => {
                // Local failure: the upstream was never observed.
                self.breakers.release(&breaker_key);
                self.record_log(tenant_id, &integration, &action, options, request_id, 0, false, attempts, latency_ms, Some(ErrorCode::Internal));
                Err(InvocationError::new(ErrorCode::Internal, format!("could not build upstream request: {message}")))
            }
            Err(error) => {
                self.breakers.record_failure(&breaker_key);
                self.record_log(
                    tenant_id,
                    &integration,
                    &action,
                    options,
                    request_id,
                    0,
                    false,
                    attempts,
                    latency_ms,
                    Some(ErrorCode::ExecutionFailed),
                );
                Err(InvocationError::new(
                    ErrorCode::ExecutionFailed,
                    format!("call to integration '{}' failed after {} attempts: {}", integration.slug, attempts, error),
                ))
            }
        }
    }

    async fn load_targets(
        &self,
        tenant_id: &str,
        integration_slug: &str,
        action_slug: &str,
        options: &InvokeOptions,
    ) -> Result<(Integration, ActionSpec, Option<Connection>), InvocationError> {
        let integration = self
            .catalog
            .find_integration(tenant_id, integration_slug)
            .await
            .map_err(|error| InvocationError::new(ErrorCode::ContextLoadFailed, format!("integration lookup failed: {error}")))?
            .ok_or_else(|| InvocationError::new(ErrorCode::NotFound, format!("integration '{integration_slug}' not found")))?;
        if !integration.enabled {
            return Err(InvocationError::new(
                ErrorCode::Disabled,
                format!("integration '{integration_slug}' is disabled"),
            ));
        }

        let action = self
            .catalog
            .find_action(tenant_id, integration_slug, action_slug)
            .await
            .map_err(|error| InvocationError::new(ErrorCode::ContextLoadFailed, format!("action lookup failed: {error}")))?
            .ok_or_else(|| {
                InvocationError::new(
                    ErrorCode::NotFound,
                    format!("action '{action_slug}' not found on integration '{integration_slug}'"),
                )
            })?;
        if !action.enabled {
            return Err(InvocationError::new(ErrorCode::Disabled, format!("action '{action_slug}' is disabled")));
        }

        let connection = match options.connection_id.as_deref() {
            Some(connection_id) => Some(
                self.catalog
                    .find_connection(tenant_id, connection_id)
                    .await
                    .map_err(|error| InvocationError::new(ErrorCode::ContextLoadFailed, format!("connection lookup failed: {error}")))?
                    .ok_or_else(|| InvocationError::new(ErrorCode::NotFound, format!("connection '{connection_id}' not found")))?,
            ),
            None => None,
        };

        Ok((integration, action, connection))
    }

    fn resolve_options(
        &self,
        tenant_id: &str,
        params: &serde_json::Map<String, Value>,
        options: &InvokeOptions,
        connection: Option<&Connection>,
        request_id: &str,
    ) -> ResolveOptions {
        let mut runtime = options
            .runtime_context
            .clone()
            .unwrap_or_else(|| RuntimeContext::new(options.environment.clone()));
        runtime.request.id = request_id.to_string();
        if runtime.connection.is_none()
            && let Some(connection) = connection
        {
            runtime.connection = Some(ConnectionInfo {
                id: connection.id.clone(),
                name: Some(connection.name.clone()),
                workspace_id: connection.workspace_id.clone(),
            });
        }

        let mut request_variables = params.clone();
        for (name, value) in &options.variables {
            request_variables.insert(name.clone(), value.clone());
        }

        ResolveOptions {
            tenant_id: tenant_id.to_string(),
            connection_id: options.connection_id.clone(),
            environment: options.environment.clone(),
            runtime_context: Some(runtime),
            request_variables,
            reference_context: options.reference_context.clone(),
            step_outputs: HashMap::new(),
            throw_on_missing: true,
        }
    }

    /// Resolves the action's templated fields and assembles the upstream
    /// call, splitting params into path placeholders, query, and body.
    async fn prepare_call(
        &self,
        action: &ActionSpec,
        params: &serde_json::Map<String, Value>,
        resolve_options: &ResolveOptions,
    ) -> Result<(PreparedCall, Value), InvocationError> {
        let template = json!({
            "path": action.path,
            "headers": action.headers,
            "query": action.query,
            "body": action.body_template,
        });

        let resolution = self.resolver.resolve(&template, resolve_options).await.map_err(|error| match error {
            ResolveError::MissingVariables { missing } => {
                InvocationError::new(ErrorCode::TemplateResolutionError, "unresolved template references")
                    .with_details(json!({ "missing": missing }))
            }
            ResolveError::Store(error) => {
                InvocationError::new(ErrorCode::ContextLoadFailed, format!("variable store failure: {error}"))
            }
        })?;

        let resolved = &resolution.resolved;
        let path_template = resolved["path"].as_str().unwrap_or(&action.path).to_string();
        let headers = string_map(&resolved["headers"]);
        let mut query: Vec<(String, String)> = Vec::new();
        if let Value::Object(map) = &resolved["query"] {
            for (name, value) in map {
                push_query_pairs(&mut query, name, value);
            }
        }
        let mut body = match &resolved["body"] {
            Value::Null => None,
            other => Some(other.clone()),
        };

        // Split params: path placeholders first, the rest goes to the query
        // (GET/DELETE) or becomes the body when no template is configured.
        let placeholders = path_placeholders(&path_template);
        let mut path_params = serde_json::Map::new();
        let mut leftover = serde_json::Map::new();
        for (name, value) in params {
            if placeholders.contains(name) {
                path_params.insert(name.clone(), value.clone());
            } else {
                leftover.insert(name.clone(), value.clone());
            }
        }
        let path = build_path(&path_template, &path_params);

        let method = action.method.to_uppercase();
        if method == "GET" || method == "DELETE" {
            for (name, value) in &leftover {
                push_query_pairs(&mut query, name, value);
            }
        } else if body.is_none() && !leftover.is_empty() {
            body = Some(Value::Object(leftover));
        }

        let timeout = action
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_timeout);

        let resolved_inputs = json!({
            "original": Value::Object(params.clone()),
            "resolved": mask_sensitive_values(&resolution),
        });

        Ok((
            PreparedCall {
                method,
                path,
                query,
                headers,
                body,
                timeout,
            },
            resolved_inputs,
        ))
    }

    /// Runs the bounded retry loop; returns the last outcome and the number
    /// of attempts performed.
    async fn attempt_set(
        &self,
        integration: &Integration,
        credential: &Credential,
        call: &PreparedCall,
        retry: RetryPolicy,
    ) -> (Result<UpstreamResponse, TransportError>, u32) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.transport.send(integration, credential, call).await {
                Ok(response) if is_transient_status(response.status) && attempts < retry.max_attempts => {
                    debug!(
                        integration = %integration.slug,
                        status = response.status,
                        attempt = attempts,
                        "retrying after transient upstream status"
                    );
                    tokio::time::sleep(retry.delay_for(attempts)).await;
                }
                Ok(response) => return (Ok(response), attempts),
                Err(error) if error.is_transient() && attempts < retry.max_attempts => {
                    debug!(
                        integration = %integration.slug,
                        error = %error,
                        attempt = attempts,
                        "retrying after transient transport error"
                    );
                    tokio::time::sleep(retry.delay_for(attempts)).await;
                }
                Err(error) => return (Err(error), attempts),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_log(
        &self,
        tenant_id: &str,
        integration: &Integration,
        action: &ActionSpec,
        options: &InvokeOptions,
        request_id: &str,
        status_code: u16,
        success: bool,
        attempts: u32,
        latency_ms: u64,
        error_code: Option<ErrorCode>,
    ) {
        self.log_sink.record(RequestLogEntry {
            request_id: request_id.to_string(),
            tenant_id: tenant_id.to_string(),
            integration_slug: integration.slug.clone(),
            action_slug: action.slug.clone(),
            connection_id: options.connection_id.clone(),
            status_code,
            success,
            attempts,
            latency_ms,
            error_code,
            completed_at: self.clock.now(),
        });
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= ERROR_BODY_SNIPPET {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(ERROR_BODY_SNIPPET).collect();
    truncated.push_str("...");
    truncated
}

fn string_map(value: &Value) -> IndexMap<String, String> {
    match value {
        Value::Object(map) => map.iter().map(|(name, value)| (name.clone(), format_value(value))).collect(),
        _ => IndexMap::new(),
    }
}

fn push_query_pairs(query: &mut Vec<(String, String)>, name: &str, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                query.push((name.to_string(), format_value(item)));
            }
        }
        other => query.push((name.to_string(), format_value(other))),
    }
}

fn path_placeholders(template: &str) -> Vec<String> {
    let mut placeholders = Vec::new();
    let mut remainder = template;
    while let Some(start) = remainder.find('{') {
        let after = &remainder[start + 1..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = after[..end].trim();
        if !name.is_empty() && !name.contains('{') {
            placeholders.push(name.to_string());
        }
        remainder = &after[end + 1..];
    }
    placeholders
}
