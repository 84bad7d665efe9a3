use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod errors;

pub use errors::{ErrorCode, InvocationError, SuggestedResolution};

/// Where an API key credential is injected into the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyPlacement {
    /// Sent as a request header.
    Header,
    /// Appended as a query-string parameter.
    Query,
}

/// Authentication scheme attached to an integration.
///
/// The set is closed on purpose: request signing dispatches over these
/// variants in one place, so adding a scheme forces every match site to be
/// revisited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    /// OAuth access token sent as `Authorization: Bearer <token>`.
    OauthBearer,
    /// Static bearer token sent as `Authorization: Bearer <token>`.
    Bearer,
    /// HTTP basic auth from the credential's username/secret pair.
    Basic,
    /// API key placed in a named header or query parameter.
    ApiKey { placement: ApiKeyPlacement, name: String },
    /// Fixed extra headers; `{{secret}}` inside a value is replaced with the
    /// credential secret at signing time.
    CustomHeaders { headers: IndexMap<String, String> },
}

/// A registered third-party HTTP API owned by a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    /// Stable identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Unique (per tenant) short name, e.g. "slack".
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Base URL all action paths are resolved against.
    pub base_url: String,
    /// How outgoing requests are authenticated.
    pub auth: AuthScheme,
    /// Disabled integrations reject all invocations.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A named credential binding for one integration.
///
/// Multiple connections per integration support multiple accounts; a
/// connection may also scope stored variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Stable identifier.
    pub id: String,
    /// Integration this connection authenticates against.
    pub integration_slug: String,
    /// Human-readable connection name.
    pub name: String,
    /// Workspace the connection belongs to, when the provider has one.
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// Credential material resolved by the credential collaborator.
///
/// Encryption at rest and OAuth refresh are external concerns; by the time a
/// credential reaches the gateway it is plaintext and ready to sign with.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identifier.
    pub id: String,
    /// Integration the credential belongs to.
    pub integration_id: String,
    /// Connection the credential is bound to, if any.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// End user the credential is scoped to, for app-issued credentials.
    #[serde(default)]
    pub external_user_id: Option<String>,
    /// Username for basic auth; unused by other schemes.
    #[serde(default)]
    pub username: Option<String>,
    /// Token / key / password material.
    pub secret: String,
    /// Inactive credentials must never be used to sign requests.
    #[serde(default = "default_true")]
    pub active: bool,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("integration_id", &self.integration_id)
            .field("connection_id", &self.connection_id)
            .field("external_user_id", &self.external_user_id)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("active", &self.active)
            .finish()
    }
}

/// One callable endpoint on an integration.
///
/// `path`, `headers`, `query`, and `body_template` may contain `${...}`
/// references resolved at invocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Stable identifier.
    pub id: String,
    /// Integration the action belongs to.
    pub integration_slug: String,
    /// Unique (per integration) short name, e.g. "send_message".
    pub slug: String,
    /// Display name.
    pub name: String,
    /// HTTP method, uppercase (GET, POST, ...).
    pub method: String,
    /// Path template relative to the integration base URL.
    pub path: String,
    /// Extra request headers (values templated).
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Query parameters (values templated).
    #[serde(default)]
    pub query: IndexMap<String, String>,
    /// JSON body template for methods that carry one.
    #[serde(default)]
    pub body_template: Option<Value>,
    /// Disabled actions reject invocation.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-call timeout; the gateway default applies when absent.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// How a composite tool decides which operation to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingMode {
    /// Ordered rule evaluation, first match wins.
    Rules { rules: Vec<RoutingRule> },
    /// Delegate the decision to an LLM.
    Agent {
        /// Extra routing guidance included in the prompt.
        #[serde(default)]
        instructions: Option<String>,
    },
}

/// Condition operator for a routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Contains,
    Equals,
    Matches,
    StartsWith,
    EndsWith,
}

/// A priority-ordered condition used to pick an operation.
///
/// Lower `priority` values are evaluated first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Operation selected when the rule matches.
    pub operation_slug: String,
    /// Condition operator.
    pub condition_type: ConditionType,
    /// Parameter field the condition reads, dot paths allowed.
    pub condition_field: String,
    /// Value the field is compared against (regex source for `matches`).
    pub condition_value: String,
    /// When false, string comparisons ignore case.
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    /// Evaluation order, ascending.
    pub priority: i32,
}

/// An action bound to a composite tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique (per tool) operation name.
    pub slug: String,
    /// Description shown to agent-driven routing.
    #[serde(default)]
    pub description: Option<String>,
    /// Target integration.
    pub integration_slug: String,
    /// Target action.
    pub action_slug: String,
    /// Tie-break / default ordering, ascending.
    #[serde(default)]
    pub priority: i32,
    /// Template mapping caller params onto the action's input.
    #[serde(default)]
    pub input_template: Option<Value>,
}

/// A single externally-invokable tool that routes to one of several
/// operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeTool {
    /// Stable identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Unique (per tenant) tool name.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Disabled tools short-circuit before routing.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Routing decision procedure.
    pub routing: RoutingMode,
    /// Operation used when no rule matches.
    #[serde(default)]
    pub default_operation: Option<String>,
    /// Operations the tool can route to.
    pub operations: Vec<Operation>,
}

impl CompositeTool {
    /// Looks up an operation by slug.
    pub fn operation(&self, slug: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.slug == slug)
    }
}

/// Lifecycle status of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Draft,
    Active,
    Disabled,
}

/// What a pipeline step invokes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepTarget {
    /// A direct action call through the gateway.
    Action {
        integration_slug: String,
        action_slug: String,
    },
    /// A composite tool routed at execution time.
    CompositeTool { slug: String },
}

/// One step of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    /// 1-based position; steps must be contiguous.
    pub step_number: u32,
    /// Name later steps use to reference this step's output
    /// (`${steps.<slug>.output...}`).
    pub slug: String,
    /// What the step invokes.
    pub target: StepTarget,
    /// Template object resolved into the target's input parameters.
    #[serde(default)]
    pub input_mapping: Option<Value>,
    /// Optional condition; when it evaluates false the step is skipped.
    #[serde(default, rename = "if")]
    pub r#if: Option<String>,
    /// Per-step timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Whether transient failures of this step may be retried downstream.
    #[serde(default = "default_true")]
    pub retryable: bool,
    /// When false, a failure of this step is recorded but does not abort
    /// the pipeline.
    #[serde(default = "default_true")]
    pub fatal: bool,
}

/// Aggregate cost and duration ceilings for one pipeline execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum accumulated cost in USD.
    pub max_cost_usd: f64,
    /// Maximum wall-clock duration for the whole run.
    pub max_duration_seconds: u64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_cost_usd: 10.0,
            max_duration_seconds: 300,
        }
    }
}

/// An ordered sequence of steps executed server-side as one logical call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Stable identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Unique (per tenant) pipeline name.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Only `active` pipelines may be invoked.
    pub status: PipelineStatus,
    /// Ordered steps.
    pub steps: Vec<PipelineStep>,
    /// Template over all step outputs producing the final `data`.
    #[serde(default)]
    pub output_mapping: Option<Value>,
    /// Cost/duration ceilings.
    #[serde(default)]
    pub safety_limits: SafetyLimits,
}

/// Terminal and non-terminal states of one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    /// True once the execution can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Outcome of one executed (or skipped) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

/// Append-only record of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Step position, matching `PipelineStep::step_number`.
    pub step_number: u32,
    /// Step slug, for `steps.<slug>.output` references.
    pub slug: String,
    /// Final state of the step.
    pub status: StepState,
    /// Output payload the step produced (null when failed/skipped).
    pub output: Value,
    /// Cost attributed to this step.
    pub cost_usd: f64,
    /// Tokens consumed by this step (LLM-backed targets).
    pub tokens: u64,
    /// Wall-clock duration of the step.
    pub duration_ms: u64,
    /// Structured error when the step did not succeed.
    #[serde(default)]
    pub error: Option<InvocationError>,
}

/// Mutable state of one pipeline invocation, returned to the caller as a
/// read-only snapshot once the run leaves `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    /// Execution identifier.
    pub id: String,
    /// Pipeline being executed.
    pub pipeline_id: String,
    /// Current status; terminal once it leaves `Running`.
    pub status: ExecutionStatus,
    /// Highest step number that has finished (0 before the first step).
    pub current_step_number: u32,
    /// Total steps in the definition.
    pub total_steps: u32,
    /// Accumulated cost across executed steps.
    pub total_cost_usd: f64,
    /// Accumulated tokens across executed steps.
    pub total_tokens: u64,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-step records in strict step order.
    pub step_results: Vec<StepRecord>,
}

/// Why a routing decision selected its operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingInfo {
    /// Operation that was selected.
    pub operation_slug: String,
    /// Human-readable explanation (matched rule, default, or agent).
    pub reason: String,
}

/// Metadata attached to every invocation envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetadata {
    /// Correlation id for the invocation.
    #[serde(default)]
    pub request_id: Option<String>,
    /// End-to-end latency as observed by the engine.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    /// Original vs. resolved values, for caller transparency.
    #[serde(default)]
    pub resolved_inputs: Option<Value>,
    /// Routing decision, for composite tool invocations.
    #[serde(default)]
    pub routing: Option<RoutingInfo>,
    /// Cost attributed to the invocation.
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// Tokens consumed by the invocation.
    #[serde(default)]
    pub tokens: Option<u64>,
}

/// Common success/error envelope produced by the gateway, router, and
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Response payload (possibly partial on failure).
    #[serde(default)]
    pub data: Value,
    /// Structured error when `success` is false.
    #[serde(default)]
    pub error: Option<InvocationError>,
    /// Always-present execution metadata.
    pub metadata: InvocationMetadata,
}

impl InvocationResult {
    /// Builds a success envelope around a payload.
    pub fn ok(data: Value, metadata: InvocationMetadata) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata,
        }
    }

    /// Builds a failure envelope around a structured error.
    pub fn err(error: InvocationError, metadata: InvocationMetadata) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error),
            metadata,
        }
    }
}

/// One cached name→id entry used to resolve human-readable names in tool
/// input (users, channels, projects, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceItem {
    /// Provider-side identifier.
    pub id: String,
    /// Human-readable name callers use.
    pub name: String,
    /// Optional provider metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Request log record handed to the logging sink once per attempt set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogEntry {
    /// Correlation id of the invocation.
    pub request_id: String,
    /// Tenant that made the call.
    pub tenant_id: String,
    /// Integration that was called.
    pub integration_slug: String,
    /// Action that was called.
    pub action_slug: String,
    /// Connection used, if any.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Final outcome status (HTTP status or 0 when no response).
    pub status_code: u16,
    /// Whether the attempt set ended in success.
    pub success: bool,
    /// Number of attempts performed (1 = no retries).
    pub attempts: u32,
    /// Total latency across all attempts.
    pub latency_ms: u64,
    /// Error code when the call failed.
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    /// When the attempt set completed.
    pub completed_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
