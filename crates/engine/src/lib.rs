//! # Conduit Engine
//!
//! The Conduit engine turns tool and pipeline invocation requests into
//! authenticated, resilient calls against a tenant's registered
//! integrations. It provides layered template resolution, per-integration
//! failure isolation, rule- and agent-driven routing, and sequential
//! pipeline orchestration under cost and duration budgets.
//!
//! ## Key Features
//!
//! - **Variable Resolution**: `${namespace.path}` references resolved
//!   against an explicit, ordered source list (request > reference data >
//!   connection > tenant > built-in context)
//! - **Action Gateway**: credential lookup, auth signing, circuit breaker,
//!   and bounded retries around every upstream HTTP call
//! - **Composite Routing**: priority-ordered rules or an LLM picker select
//!   the operation; parameters are mapped before any network I/O
//! - **Pipeline Orchestration**: strictly sequential steps with per-step
//!   timeouts, cooperative cancellation, and safety limits that preserve
//!   partial results
//!
//! ## Architecture
//!
//! - **`resolver`**: template parsing, layered resolution, masking
//! - **`gateway`**: the action gateway with its breaker, retry, and
//!   transport submodules
//! - **`router`**: composite tool routing and parameter mapping
//! - **`pipeline`**: the orchestrator, cancellation, and document loading
//! - **`service`**: transport-agnostic request/response contracts
//! - **`store`**: collaborator traits (catalog, credentials, variables,
//!   request log) plus an in-memory implementation
//! - **`clock`**: injected time source for breakers and budgets
//!
//! Everything stateful is per-invocation except the circuit breaker
//! registry, which is shared across calls and guarded by a keyed mutex.

pub mod clock;
pub mod gateway;
pub mod llm;
pub mod pipeline;
pub mod resolver;
pub mod router;
pub mod service;
pub mod store;

// Re-export commonly used types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use gateway::{ActionGateway, GatewayConfig, HttpTransport, InvokeOptions, RetryPolicy};
pub use llm::{AnthropicPicker, AnthropicPickerConfig, OperationPicker};
pub use pipeline::{
    CancelHandle, EngineInvoker, ExecutionOptions, OrchestratorConfig, PipelineOrchestrator, PipelineRun,
    ToolInvoker, parse_pipeline_file,
};
pub use resolver::{
    ResolutionResult, ResolutionSource, ResolutionSummary, ResolveError, ResolveOptions, ResolvedVariable,
    RuntimeContext, TemplateValidation, VariableResolver, mask_sensitive_values, summarize_resolution,
};
pub use router::{CompositeToolRouter, RouteDecision, RouterConfig};
pub use service::{
    CompositeInvocationRequest, InvocationService, PipelineInvocationRequest, PipelineInvocationResponse,
    TemplatePreviewRequest, TemplatePreviewResponse, ToolInvocationRequest,
};
pub use store::{
    Catalog, CredentialResolver, ExternalUserRef, MemoryLogSink, MemoryStore, NoopLogSink, RequestLogSink,
    StoredVariable, VariableStore,
};
