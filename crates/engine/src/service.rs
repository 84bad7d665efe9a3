//! Transport-agnostic invocation service.
//!
//! The thin HTTP layer that fronts this engine parses a request, resolves
//! the tenant, and dispatches into one of these entry points. The JSON
//! contracts here are the engine's public surface: single tool calls,
//! composite tool calls, pipeline runs, and template preview/validation.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_types::{
    ErrorCode, InvocationError, InvocationResult, PipelineExecution, ReferenceItem,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::{ActionGateway, InvokeOptions};
use crate::pipeline::{CancelHandle, ExecutionOptions, PipelineOrchestrator, PipelineRun};
use crate::resolver::{
    ResolutionSummary, ResolveError, ResolveOptions, VariableResolver, mask_sensitive_values, summarize_resolution,
};
use crate::router::CompositeToolRouter;
use crate::store::Catalog;

/// Input for a single tool invocation (`"<integration>_<action>"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRequest {
    /// Flattened tool name, e.g. `slack_send_message`.
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    /// Reference data keyed by namespace.
    #[serde(default)]
    pub context: HashMap<String, Vec<ReferenceItem>>,
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Runtime variable overrides.
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default)]
    pub options: ToolInvocationOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationOptions {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub external_user_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Input for a composite tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeInvocationRequest {
    /// Composite tool slug.
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    #[serde(default)]
    pub options: CompositeInvocationOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeInvocationOptions {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Vec<ReferenceItem>>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Input for a pipeline invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInvocationRequest {
    /// Pipeline slug or id.
    pub pipeline: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    #[serde(default)]
    pub options: PipelineInvocationOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInvocationOptions {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Vec<ReferenceItem>>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

/// Pipeline invocation envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineInvocationResponse {
    pub success: bool,
    /// Mapped output, or partial step outputs on failure.
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
    pub meta: PipelineMeta,
    /// Terminal execution snapshot.
    pub execution: PipelineExecution,
}

/// Aggregate metadata reported for every pipeline run, success or not.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMeta {
    /// Steps that produced a record (executed, failed, or skipped).
    pub steps: u32,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub total_tokens: u64,
}

/// Input for the template preview/validate endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePreviewRequest {
    pub template: Value,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Vec<ReferenceItem>>,
    /// When false only resolvability is reported; no values are computed.
    #[serde(default)]
    pub resolve: bool,
}

/// Preview/validate outcome. `resolved` is always masked.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePreviewResponse {
    pub valid: bool,
    pub resolvable: Vec<String>,
    pub unresolvable: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ResolutionSummary>,
}

/// Dispatches invocation requests into the engine.
pub struct InvocationService {
    catalog: Arc<dyn Catalog>,
    gateway: Arc<ActionGateway>,
    router: Arc<CompositeToolRouter>,
    orchestrator: Arc<PipelineOrchestrator>,
    resolver: VariableResolver,
}

impl InvocationService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        gateway: Arc<ActionGateway>,
        router: Arc<CompositeToolRouter>,
        orchestrator: Arc<PipelineOrchestrator>,
        resolver: VariableResolver,
    ) -> Self {
        Self {
            catalog,
            gateway,
            router,
            orchestrator,
            resolver,
        }
    }

    /// Invokes a single action addressed as `<integration>_<action>`.
    pub async fn invoke_tool(&self, tenant_id: &str, request: ToolInvocationRequest) -> InvocationResult {
        let (integration_slug, action_slug) = match self.split_tool_name(tenant_id, &request.tool).await {
            Ok(split) => split,
            Err(error) => return InvocationResult::err(error, Default::default()),
        };

        let options = InvokeOptions {
            connection_id: request.connection_id,
            reference_context: request.context,
            variables: request.variables,
            app_id: request.options.app_id,
            external_user_id: request.options.external_user_id,
            runtime_context: None,
            environment: request.options.environment,
            request_id: request.options.request_id,
            retry: None,
        };
        self.gateway
            .invoke(tenant_id, &integration_slug, &action_slug, request.params, &options)
            .await
    }

    /// Invokes a composite tool by slug.
    pub async fn invoke_composite(&self, tenant_id: &str, request: CompositeInvocationRequest) -> InvocationResult {
        let tool = match self.catalog.find_composite_tool(tenant_id, &request.tool).await {
            Ok(Some(tool)) => tool,
            Ok(None) => {
                return InvocationResult::err(
                    InvocationError::new(ErrorCode::NotFound, format!("composite tool '{}' not found", request.tool)),
                    Default::default(),
                );
            }
            Err(error) => {
                return InvocationResult::err(
                    InvocationError::new(ErrorCode::ContextLoadFailed, format!("composite tool lookup failed: {error}")),
                    Default::default(),
                );
            }
        };

        let options = InvokeOptions {
            connection_id: request.options.connection_id,
            reference_context: request.options.context,
            variables: serde_json::Map::new(),
            app_id: None,
            external_user_id: None,
            runtime_context: None,
            environment: request.options.environment,
            request_id: request.options.request_id,
            retry: None,
        };
        self.router.invoke(tenant_id, &tool, request.params, &options).await
    }

    /// Runs a pipeline to completion (or any other terminal state).
    ///
    /// The caller keeps the [`CancelHandle`]; cancelling it stops the run at
    /// the next step boundary.
    pub async fn invoke_pipeline(
        &self,
        tenant_id: &str,
        request: PipelineInvocationRequest,
        cancel: &CancelHandle,
    ) -> PipelineInvocationResponse {
        let pipeline = match self.catalog.find_pipeline(tenant_id, &request.pipeline).await {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => {
                return error_response(
                    InvocationError::new(ErrorCode::NotFound, format!("pipeline '{}' not found", request.pipeline)),
                );
            }
            Err(error) => {
                return error_response(InvocationError::new(
                    ErrorCode::ContextLoadFailed,
                    format!("pipeline lookup failed: {error}"),
                ));
            }
        };

        let options = ExecutionOptions {
            request_id: request.options.request_id,
            connection_id: request.options.connection_id,
            environment: request.options.environment,
            runtime_context: None,
            reference_context: request.options.context,
            variables: serde_json::Map::new(),
        };
        let run = self.orchestrator.execute(tenant_id, &pipeline, request.params, &options, cancel).await;
        response_from_run(run)
    }

    /// Validates a template and, when `resolve` is set, previews its masked
    /// resolution.
    pub async fn preview_template(
        &self,
        tenant_id: &str,
        request: TemplatePreviewRequest,
    ) -> Result<TemplatePreviewResponse, InvocationError> {
        let options = ResolveOptions {
            tenant_id: tenant_id.to_string(),
            connection_id: request.connection_id.clone(),
            environment: request.environment.clone(),
            reference_context: request.context.clone(),
            ..ResolveOptions::default()
        };

        let validation = self
            .resolver
            .validate(&request.template, &options)
            .await
            .map_err(store_error)?;

        if !request.resolve {
            return Ok(TemplatePreviewResponse {
                valid: validation.valid,
                resolvable: validation.resolvable,
                unresolvable: validation.unresolvable,
                resolved: None,
                summary: None,
            });
        }

        let result = self.resolver.resolve(&request.template, &options).await.map_err(store_error)?;
        Ok(TemplatePreviewResponse {
            valid: validation.valid,
            resolvable: validation.resolvable,
            unresolvable: validation.unresolvable,
            resolved: Some(mask_sensitive_values(&result)),
            summary: Some(summarize_resolution(&result)),
        })
    }

    /// Resolves `<integration>_<action>` by the longest integration-slug
    /// prefix registered for the tenant. Slugs may contain underscores, so
    /// the longest match wins.
    async fn split_tool_name(&self, tenant_id: &str, tool: &str) -> Result<(String, String), InvocationError> {
        let slugs = self
            .catalog
            .integration_slugs(tenant_id)
            .await
            .map_err(|error| InvocationError::new(ErrorCode::ContextLoadFailed, format!("integration list failed: {error}")))?;

        let mut best: Option<(String, String)> = None;
        for slug in slugs {
            if let Some(action) = tool.strip_prefix(&format!("{slug}_"))
                && !action.is_empty()
                && best.as_ref().map(|(current, _)| slug.len() > current.len()).unwrap_or(true)
            {
                best = Some((slug, action.to_string()));
            }
        }

        best.ok_or_else(|| {
            InvocationError::new(
                ErrorCode::NotFound,
                format!("tool '{tool}' does not match any registered integration"),
            )
        })
    }
}

fn store_error(error: ResolveError) -> InvocationError {
    match error {
        ResolveError::MissingVariables { missing } => {
            InvocationError::new(ErrorCode::TemplateResolutionError, "unresolved template references")
                .with_details(serde_json::json!({ "missing": missing }))
        }
        ResolveError::Store(error) => InvocationError::new(ErrorCode::ContextLoadFailed, format!("variable store failure: {error}")),
    }
}

fn response_from_run(run: PipelineRun) -> PipelineInvocationResponse {
    let execution = run.execution;
    let total_duration_ms = execution
        .completed_at
        .map(|completed_at| (completed_at - execution.started_at).num_milliseconds().max(0) as u64)
        .unwrap_or(0);
    PipelineInvocationResponse {
        success: run.error.is_none(),
        data: run.data,
        error: run.error,
        meta: PipelineMeta {
            steps: execution.step_results.len() as u32,
            total_cost_usd: execution.total_cost_usd,
            total_duration_ms,
            total_tokens: execution.total_tokens,
        },
        execution,
    }
}

fn error_response(error: InvocationError) -> PipelineInvocationResponse {
    use chrono::Utc;
    use conduit_types::ExecutionStatus;

    PipelineInvocationResponse {
        success: false,
        data: Value::Null,
        error: Some(error),
        meta: PipelineMeta {
            steps: 0,
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            total_tokens: 0,
        },
        execution: PipelineExecution {
            id: String::new(),
            pipeline_id: String::new(),
            status: ExecutionStatus::Failed,
            current_step_number: 0,
            total_steps: 0,
            total_cost_usd: 0.0,
            total_tokens: 0,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            step_results: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::{
        ActionTransport, BreakerConfig, GatewayConfig, PreparedCall, RetryPolicy, TransportError, UpstreamResponse,
    };
    use crate::pipeline::{EngineInvoker, OrchestratorConfig};
    use crate::router::RouterConfig;
    use crate::store::{MemoryLogSink, MemoryStore, StoredVariable};
    use async_trait::async_trait;
    use conduit_types::{
        ActionSpec, AuthScheme, Credential, Integration, Pipeline, PipelineStatus, PipelineStep, SafetyLimits,
        StepTarget,
    };
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct EchoTransport {
        calls: Mutex<Vec<PreparedCall>>,
    }

    impl EchoTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(vec![]) })
        }
    }

    #[async_trait]
    impl ActionTransport for EchoTransport {
        async fn send(
            &self,
            _integration: &Integration,
            _credential: &Credential,
            call: &PreparedCall,
        ) -> Result<UpstreamResponse, TransportError> {
            self.calls.lock().unwrap().push(call.clone());
            Ok(UpstreamResponse {
                status: 200,
                body: json!({"echo": call.path}).to_string(),
            })
        }
    }

    fn integration(slug: &str) -> Integration {
        Integration {
            id: format!("int-{slug}"),
            tenant_id: "tenant-a".into(),
            slug: slug.into(),
            name: slug.into(),
            base_url: "https://api.example.com".into(),
            auth: AuthScheme::Bearer,
            enabled: true,
        }
    }

    fn action(integration_slug: &str, slug: &str) -> ActionSpec {
        ActionSpec {
            id: format!("act-{slug}"),
            integration_slug: integration_slug.into(),
            slug: slug.into(),
            name: slug.into(),
            method: "POST".into(),
            path: format!("/{slug}"),
            headers: IndexMap::new(),
            query: IndexMap::new(),
            body_template: None,
            enabled: true,
            timeout_seconds: None,
        }
    }

    fn credential(integration_slug: &str) -> Credential {
        Credential {
            id: format!("cred-{integration_slug}"),
            integration_id: format!("int-{integration_slug}"),
            connection_id: None,
            external_user_id: None,
            username: None,
            secret: "tok".into(),
            active: true,
        }
    }

    fn service_with(store: MemoryStore) -> InvocationService {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let resolver = VariableResolver::new(store.clone());
        let gateway = Arc::new(ActionGateway::new(
            store.clone(),
            store.clone(),
            resolver.clone(),
            EchoTransport::new(),
            Arc::new(MemoryLogSink::new()),
            clock.clone(),
            GatewayConfig {
                default_timeout: Duration::from_secs(5),
                retry: RetryPolicy::default(),
                breaker: BreakerConfig::default(),
            },
        ));
        let router = Arc::new(CompositeToolRouter::new(
            gateway.clone(),
            resolver.clone(),
            None,
            RouterConfig::default(),
        ));
        let invoker = Arc::new(EngineInvoker::new(gateway.clone(), router.clone(), store.clone()));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            invoker,
            resolver.clone(),
            clock,
            OrchestratorConfig::default(),
        ));
        InvocationService::new(store, gateway, router, orchestrator, resolver)
    }

    fn default_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .add_integration(integration("slack"))
            .add_integration(integration("google"))
            .add_integration(integration("google_calendar"))
            .add_action(action("slack", "send_message"))
            .add_action(action("google_calendar", "create_event"))
            .add_credential(credential("slack"))
            .add_credential(credential("google_calendar"));
        store
    }

    fn tool_request(tool: &str) -> ToolInvocationRequest {
        ToolInvocationRequest {
            tool: tool.into(),
            params: serde_json::Map::new(),
            context: HashMap::new(),
            connection_id: None,
            variables: serde_json::Map::new(),
            options: ToolInvocationOptions::default(),
        }
    }

    #[tokio::test]
    async fn tool_names_resolve_by_longest_integration_prefix() {
        let service = service_with(default_store());

        let result = service.invoke_tool("tenant-a", tool_request("google_calendar_create_event")).await;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.data["echo"], json!("/create_event"));
    }

    #[tokio::test]
    async fn unknown_tool_prefix_is_not_found() {
        let service = service_with(default_store());

        let result = service.invoke_tool("tenant-a", tool_request("github_create_issue")).await;
        assert_eq!(result.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn single_tool_invocation_round_trips() {
        let service = service_with(default_store());

        let result = service.invoke_tool("tenant-a", tool_request("slack_send_message")).await;
        assert!(result.success);
        assert!(result.metadata.request_id.is_some());
    }

    #[tokio::test]
    async fn pipeline_invocation_reports_meta() {
        let mut store = default_store();
        store.add_pipeline(Pipeline {
            id: "pipe-1".into(),
            tenant_id: "tenant-a".into(),
            slug: "notify".into(),
            name: "Notify".into(),
            status: PipelineStatus::Active,
            steps: vec![PipelineStep {
                step_number: 1,
                slug: "send".into(),
                target: StepTarget::Action {
                    integration_slug: "slack".into(),
                    action_slug: "send_message".into(),
                },
                input_mapping: None,
                r#if: None,
                timeout_seconds: None,
                retryable: true,
                fatal: true,
            }],
            output_mapping: None,
            safety_limits: SafetyLimits::default(),
        });
        let service = service_with(store);

        let response = service
            .invoke_pipeline(
                "tenant-a",
                PipelineInvocationRequest {
                    pipeline: "notify".into(),
                    params: serde_json::Map::new(),
                    options: PipelineInvocationOptions::default(),
                },
                &CancelHandle::new(),
            )
            .await;
        assert!(response.success, "error: {:?}", response.error);
        assert_eq!(response.meta.steps, 1);
        assert_eq!(response.execution.status, conduit_types::ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn missing_pipeline_returns_not_found_envelope() {
        let service = service_with(default_store());

        let response = service
            .invoke_pipeline(
                "tenant-a",
                PipelineInvocationRequest {
                    pipeline: "nope".into(),
                    params: serde_json::Map::new(),
                    options: PipelineInvocationOptions::default(),
                },
                &CancelHandle::new(),
            )
            .await;
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.code, ErrorCode::NotFound);
        assert_eq!(error.code.http_status(), 404);
    }

    #[tokio::test]
    async fn preview_without_resolve_reports_validity_only() {
        let mut store = default_store();
        store.add_tenant_variable("tenant-a", "region", StoredVariable::plain("eu"));
        let service = service_with(store);

        let response = service
            .preview_template(
                "tenant-a",
                TemplatePreviewRequest {
                    template: json!("${region} ${missing_one}"),
                    connection_id: None,
                    environment: None,
                    context: HashMap::new(),
                    resolve: false,
                },
            )
            .await
            .unwrap();
        assert!(!response.valid);
        assert_eq!(response.resolvable, vec!["region".to_string()]);
        assert_eq!(response.unresolvable, vec!["missing_one".to_string()]);
        assert!(response.resolved.is_none());
        assert!(response.summary.is_none());
    }

    #[tokio::test]
    async fn preview_with_resolve_masks_sensitive_values() {
        let mut store = default_store();
        store.add_tenant_variable("tenant-a", "api_token", StoredVariable::secret("sk-secret"));
        let service = service_with(store);

        let response = service
            .preview_template(
                "tenant-a",
                TemplatePreviewRequest {
                    template: json!({"auth": "${api_token}"}),
                    connection_id: None,
                    environment: None,
                    context: HashMap::new(),
                    resolve: true,
                },
            )
            .await
            .unwrap();
        assert!(response.valid);
        let resolved = response.resolved.unwrap();
        assert!(!resolved.to_string().contains("sk-secret"));
        let summary = response.summary.unwrap();
        assert_eq!(summary.sensitive, 1);
    }
}
