//! Error taxonomy shared by the gateway, router, and orchestrator.
//!
//! The source of truth is [`ErrorCode`]: a closed set of invocation failure
//! kinds that callers pattern-match exhaustively. [`InvocationError`] wraps a
//! code with the human-facing message, optional details, and a remediation
//! hint. Transport layers derive their HTTP status from
//! [`ErrorCode::http_status`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed set of invocation failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Tool/pipeline/operation/integration absent or not owned by the tenant.
    NotFound,
    /// Entity exists but is disabled.
    Disabled,
    /// Entity exists but is not in an invokable status.
    NotActive,
    /// Request failed schema/validation checks; never reached the network.
    InvalidInput,
    /// Composite-tool routing could not select an operation.
    RoutingFailed,
    /// Caller parameters could not be mapped onto the operation input.
    ParameterMappingFailed,
    /// No active credential for the integration/connection.
    MissingCredentials,
    /// Reference-data context could not be loaded.
    ContextLoadFailed,
    /// Circuit breaker is open; no network call was attempted.
    CircuitOpen,
    /// Underlying call failed after retries.
    ExecutionFailed,
    /// A pipeline step failed.
    StepFailed,
    /// A pipeline step exceeded its timeout.
    StepTimeout,
    /// Aggregate cost ceiling tripped; partial results preserved.
    CostLimitExceeded,
    /// Aggregate duration ceiling tripped; partial results preserved.
    DurationLimitExceeded,
    /// Cooperative cancellation observed at a step boundary.
    ExecutionCancelled,
    /// One or more required template references were unresolved.
    TemplateResolutionError,
    /// Pipeline has no steps or malformed step numbering.
    EmptyPipeline,
    /// Composite tool is disabled.
    CompositeToolDisabled,
    /// Pipeline exists but is a draft.
    PipelineNotActive,
    /// Pipeline exists but is disabled.
    PipelineDisabled,
    /// Unexpected failure inside the engine.
    Internal,
}

impl ErrorCode {
    /// Wire representation, matching the serde encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Disabled => "DISABLED",
            ErrorCode::NotActive => "NOT_ACTIVE",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::RoutingFailed => "ROUTING_FAILED",
            ErrorCode::ParameterMappingFailed => "PARAMETER_MAPPING_FAILED",
            ErrorCode::MissingCredentials => "MISSING_CREDENTIALS",
            ErrorCode::ContextLoadFailed => "CONTEXT_LOAD_FAILED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::StepFailed => "STEP_FAILED",
            ErrorCode::StepTimeout => "STEP_TIMEOUT",
            ErrorCode::CostLimitExceeded => "COST_LIMIT_EXCEEDED",
            ErrorCode::DurationLimitExceeded => "DURATION_LIMIT_EXCEEDED",
            ErrorCode::ExecutionCancelled => "EXECUTION_CANCELLED",
            ErrorCode::TemplateResolutionError => "TEMPLATE_RESOLUTION_ERROR",
            ErrorCode::EmptyPipeline => "EMPTY_PIPELINE",
            ErrorCode::CompositeToolDisabled => "COMPOSITE_TOOL_DISABLED",
            ErrorCode::PipelineNotActive => "PIPELINE_NOT_ACTIVE",
            ErrorCode::PipelineDisabled => "PIPELINE_DISABLED",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP-equivalent status for transport layers.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::Disabled
            | ErrorCode::NotActive
            | ErrorCode::CompositeToolDisabled
            | ErrorCode::PipelineNotActive
            | ErrorCode::PipelineDisabled => 403,
            ErrorCode::InvalidInput
            | ErrorCode::RoutingFailed
            | ErrorCode::ParameterMappingFailed
            | ErrorCode::TemplateResolutionError
            | ErrorCode::EmptyPipeline => 400,
            ErrorCode::CostLimitExceeded | ErrorCode::DurationLimitExceeded => 429,
            ErrorCode::ExecutionCancelled => 499,
            ErrorCode::MissingCredentials
            | ErrorCode::ContextLoadFailed
            | ErrorCode::CircuitOpen
            | ErrorCode::ExecutionFailed
            | ErrorCode::StepFailed
            | ErrorCode::StepTimeout => 502,
            ErrorCode::Internal => 500,
        }
    }

    /// Whether retrying the same request may succeed without caller changes.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::CircuitOpen
                | ErrorCode::ExecutionFailed
                | ErrorCode::StepTimeout
                | ErrorCode::ContextLoadFailed
        )
    }

    /// Default remediation hint for this code.
    pub fn default_resolution(&self) -> SuggestedResolution {
        let (action, description) = match self {
            ErrorCode::NotFound => ("check_identifier", "Verify the slug exists and belongs to this tenant."),
            ErrorCode::Disabled | ErrorCode::NotActive | ErrorCode::CompositeToolDisabled => {
                ("enable_entity", "Enable the entity before invoking it.")
            }
            ErrorCode::PipelineNotActive | ErrorCode::PipelineDisabled => {
                ("activate_pipeline", "Publish or re-enable the pipeline before invoking it.")
            }
            ErrorCode::InvalidInput => ("fix_input", "Correct the request parameters and retry."),
            ErrorCode::RoutingFailed => (
                "add_routing_rule",
                "Add a matching routing rule or configure a default operation.",
            ),
            ErrorCode::ParameterMappingFailed => (
                "fix_parameters",
                "Supply the parameters the selected operation's input template requires.",
            ),
            ErrorCode::MissingCredentials => (
                "connect_account",
                "Connect an account for this integration or select a valid connection.",
            ),
            ErrorCode::ContextLoadFailed => ("retry_later", "Reference data was unavailable; retry shortly."),
            ErrorCode::CircuitOpen => (
                "wait_for_recovery",
                "The integration is failing; calls resume automatically after the cooldown.",
            ),
            ErrorCode::ExecutionFailed => ("retry_later", "The upstream call failed after retries; retry shortly."),
            ErrorCode::StepFailed => ("inspect_step", "Inspect the failing step's error and partial results."),
            ErrorCode::StepTimeout => ("raise_timeout", "Raise the step timeout or retry the pipeline."),
            ErrorCode::CostLimitExceeded => ("raise_cost_limit", "Raise max_cost_usd or shorten the pipeline."),
            ErrorCode::DurationLimitExceeded => {
                ("raise_duration_limit", "Raise max_duration_seconds or shorten the pipeline.")
            }
            ErrorCode::ExecutionCancelled => ("none", "The execution was cancelled on request."),
            ErrorCode::TemplateResolutionError => (
                "provide_variables",
                "Provide values for the missing template references.",
            ),
            ErrorCode::EmptyPipeline => ("add_steps", "Define at least one step with contiguous numbering."),
            ErrorCode::Internal => ("contact_support", "An unexpected error occurred; contact support."),
        };
        SuggestedResolution {
            action: action.to_string(),
            description: description.to_string(),
            retryable: self.retryable(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation hint attached to error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedResolution {
    /// Machine-readable remediation action.
    pub action: String,
    /// Human-readable remediation description.
    pub description: String,
    /// Whether retrying the same request may succeed.
    pub retryable: bool,
}

/// Structured invocation error.
///
/// `details` must never contain secrets or raw credential material; callers
/// run upstream text through redaction before attaching it.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct InvocationError {
    /// Failure kind.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context (redacted upstream body, missing paths, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Correlation id of the failed invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_resolution: Option<SuggestedResolution>,
}

impl InvocationError {
    /// Creates an error with the code's default remediation hint.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: None,
            suggested_resolution: Some(code.default_resolution()),
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attaches the invocation's correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake_case() {
        let encoded = serde_json::to_value(ErrorCode::CircuitOpen).unwrap();
        assert_eq!(encoded, "CIRCUIT_OPEN");
        assert_eq!(ErrorCode::Internal.as_str(), "INTERNAL_ERROR");
    }

    #[test]
    fn http_status_follows_the_transport_table() {
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::PipelineDisabled.http_status(), 403);
        assert_eq!(ErrorCode::TemplateResolutionError.http_status(), 400);
        assert_eq!(ErrorCode::CostLimitExceeded.http_status(), 429);
        assert_eq!(ErrorCode::ExecutionCancelled.http_status(), 499);
        assert_eq!(ErrorCode::StepTimeout.http_status(), 502);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn new_attaches_default_resolution() {
        let error = InvocationError::new(ErrorCode::MissingCredentials, "no credential for slack");
        let resolution = error.suggested_resolution.as_ref().expect("resolution");
        assert_eq!(resolution.action, "connect_account");
        assert!(!resolution.retryable);
        assert_eq!(error.to_string(), "MISSING_CREDENTIALS: no credential for slack");
    }

    #[test]
    fn retryable_hints() {
        assert!(ErrorCode::CircuitOpen.retryable());
        assert!(ErrorCode::ExecutionFailed.retryable());
        assert!(!ErrorCode::RoutingFailed.retryable());
        assert!(!ErrorCode::ExecutionCancelled.retryable());
    }
}
