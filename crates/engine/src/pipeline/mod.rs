//! Pipeline orchestration: a strictly sequential, budget-bounded state
//! machine over an ordered list of steps.
//!
//! Each step resolves its input mapping against the standard runtime context
//! plus a `steps.<slug>.output` namespace fed by earlier steps, invokes its
//! target (a direct action or a composite tool) under a per-step timeout,
//! and appends a [`StepRecord`]. Cancellation is cooperative: the flag is
//! observed at step boundaries only, so in-flight calls always run to
//! completion or their own timeout. Safety limits are checked before every
//! step; tripping one preserves the partial results collected so far.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_types::{
    ErrorCode, ExecutionStatus, InvocationError, InvocationResult, Pipeline, PipelineExecution, PipelineStep,
    ReferenceItem, StepRecord, StepState, StepTarget,
};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod document;

pub use document::{PipelineBundle, parse_pipeline_file};

use crate::clock::Clock;
use crate::gateway::{ActionGateway, InvokeOptions};
use crate::resolver::{ResolveError, ResolveOptions, RuntimeContext, VariableResolver, template::format_value};
use crate::router::CompositeToolRouter;
use crate::store::Catalog;

/// Cooperative cancellation flag shared with the caller.
///
/// Setting it never aborts an in-flight call; it prevents the next step from
/// starting.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation at the next step boundary.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Invokes one step target. Production uses [`EngineInvoker`]; tests swap in
/// scripted implementations.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        tenant_id: &str,
        target: &StepTarget,
        params: serde_json::Map<String, Value>,
        options: &InvokeOptions,
    ) -> InvocationResult;
}

/// Production invoker dispatching to the gateway or the composite router.
pub struct EngineInvoker {
    gateway: Arc<ActionGateway>,
    router: Arc<CompositeToolRouter>,
    catalog: Arc<dyn Catalog>,
}

impl EngineInvoker {
    pub fn new(gateway: Arc<ActionGateway>, router: Arc<CompositeToolRouter>, catalog: Arc<dyn Catalog>) -> Self {
        Self { gateway, router, catalog }
    }
}

#[async_trait]
impl ToolInvoker for EngineInvoker {
    async fn invoke(
        &self,
        tenant_id: &str,
        target: &StepTarget,
        params: serde_json::Map<String, Value>,
        options: &InvokeOptions,
    ) -> InvocationResult {
        match target {
            StepTarget::Action {
                integration_slug,
                action_slug,
            } => self.gateway.invoke(tenant_id, integration_slug, action_slug, params, options).await,
            StepTarget::CompositeTool { slug } => {
                let tool = match self.catalog.find_composite_tool(tenant_id, slug).await {
                    Ok(Some(tool)) => tool,
                    Ok(None) => {
                        return InvocationResult::err(
                            InvocationError::new(ErrorCode::NotFound, format!("composite tool '{slug}' not found")),
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
                self.router.invoke(tenant_id, &tool, params, options).await
            }
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Timeout for steps that do not declare their own.
    pub default_step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Correlation id; generated when absent.
    pub request_id: Option<String>,
    pub connection_id: Option<String>,
    pub environment: Option<String>,
    pub runtime_context: Option<RuntimeContext>,
    /// Reference data forwarded to every step.
    pub reference_context: HashMap<String, Vec<ReferenceItem>>,
    /// Runtime variable overrides forwarded to every step.
    pub variables: serde_json::Map<String, Value>,
}

/// Final outcome of one pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Read-only snapshot; status is always terminal.
    pub execution: PipelineExecution,
    /// Mapped output on success, partial step outputs otherwise.
    pub data: Value,
    pub error: Option<InvocationError>,
}

impl PipelineRun {
    pub fn success(&self) -> bool {
        self.execution.status == ExecutionStatus::Completed && self.error.is_none()
    }
}

/// The orchestrator.
pub struct PipelineOrchestrator {
    invoker: Arc<dyn ToolInvoker>,
    resolver: VariableResolver,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        resolver: VariableResolver,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            invoker,
            resolver,
            clock,
            config,
        }
    }

    /// Runs a pipeline to a terminal state.
    pub async fn execute(
        &self,
        tenant_id: &str,
        pipeline: &Pipeline,
        params: serde_json::Map<String, Value>,
        options: &ExecutionOptions,
        cancel: &CancelHandle,
    ) -> PipelineRun {
        let request_id = options.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = self.clock.now();

        let mut execution = PipelineExecution {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline.id.clone(),
            status: ExecutionStatus::Running,
            current_step_number: 0,
            total_steps: pipeline.steps.len() as u32,
            total_cost_usd: 0.0,
            total_tokens: 0,
            started_at,
            completed_at: None,
            step_results: Vec::new(),
        };

        if let Err(error) = validate_definition(pipeline) {
            execution.status = ExecutionStatus::Failed;
            execution.completed_at = Some(self.clock.now());
            return PipelineRun {
                execution,
                data: Value::Null,
                error: Some(error.with_request_id(request_id)),
            };
        }

        let mut steps: Vec<&PipelineStep> = pipeline.steps.iter().collect();
        steps.sort_by_key(|step| step.step_number);

        let limits = pipeline.safety_limits;
        let mut steps_context: HashMap<String, Value> = HashMap::new();
        let mut run_error: Option<InvocationError> = None;
        let mut final_status = ExecutionStatus::Completed;

        let invoke_options = InvokeOptions {
            connection_id: options.connection_id.clone(),
            reference_context: options.reference_context.clone(),
            variables: options.variables.clone(),
            app_id: None,
            external_user_id: None,
            runtime_context: options.runtime_context.clone(),
            environment: options.environment.clone(),
            request_id: Some(request_id.clone()),
            retry: None,
        };

        for step in steps {
            // Cancellation is only observed here, between steps.
            if cancel.is_cancelled() {
                final_status = ExecutionStatus::Cancelled;
                run_error = Some(InvocationError::new(
                    ErrorCode::ExecutionCancelled,
                    format!("pipeline '{}' cancelled before step {}", pipeline.slug, step.step_number),
                ));
                break;
            }

            // Safety limits, checked before each step starts.
            let elapsed = (self.clock.now() - started_at).num_seconds().max(0) as u64;
            if elapsed > limits.max_duration_seconds {
                final_status = ExecutionStatus::Timeout;
                run_error = Some(
                    InvocationError::new(
                        ErrorCode::DurationLimitExceeded,
                        format!("pipeline exceeded {}s duration limit", limits.max_duration_seconds),
                    )
                    .with_details(json!({"elapsed_seconds": elapsed})),
                );
                break;
            }
            if execution.total_cost_usd > limits.max_cost_usd {
                final_status = ExecutionStatus::Failed;
                run_error = Some(
                    InvocationError::new(
                        ErrorCode::CostLimitExceeded,
                        format!("pipeline exceeded ${:.2} cost limit", limits.max_cost_usd),
                    )
                    .with_details(json!({"total_cost_usd": execution.total_cost_usd})),
                );
                break;
            }

            let resolve_options = ResolveOptions {
                tenant_id: tenant_id.to_string(),
                connection_id: options.connection_id.clone(),
                environment: options.environment.clone(),
                runtime_context: options.runtime_context.clone(),
                request_variables: merged_variables(&params, &options.variables),
                reference_context: options.reference_context.clone(),
                step_outputs: steps_context.clone(),
                throw_on_missing: true,
            };

            // Optional step condition; false skips without invoking.
            if let Some(condition) = &step.r#if
                && !self.eval_condition(condition, &resolve_options).await
            {
                debug!(pipeline = %pipeline.slug, step = step.step_number, "step skipped by condition");
                execution.current_step_number = step.step_number;
                execution.step_results.push(StepRecord {
                    step_number: step.step_number,
                    slug: step.slug.clone(),
                    status: StepState::Skipped,
                    output: Value::Null,
                    cost_usd: 0.0,
                    tokens: 0,
                    duration_ms: 0,
                    error: None,
                });
                continue;
            }

            // Resolve the step input mapping.
            let step_params = match self.resolve_step_input(step, &params, &resolve_options).await {
                Ok(step_params) => step_params,
                Err(error) => {
                    execution.current_step_number = step.step_number;
                    execution.step_results.push(StepRecord {
                        step_number: step.step_number,
                        slug: step.slug.clone(),
                        status: StepState::Failed,
                        output: Value::Null,
                        cost_usd: 0.0,
                        tokens: 0,
                        duration_ms: 0,
                        error: Some(error.clone()),
                    });
                    if step.fatal {
                        final_status = ExecutionStatus::Failed;
                        run_error = Some(error);
                        break;
                    }
                    continue;
                }
            };

            // Invoke the target under the per-step timeout. Non-retryable
            // steps get a single gateway attempt.
            let timeout = step.timeout_seconds.map(Duration::from_secs).unwrap_or(self.config.default_step_timeout);
            let mut step_options = invoke_options.clone();
            if !step.retryable {
                step_options.retry = Some(crate::gateway::RetryPolicy {
                    max_attempts: 1,
                    ..Default::default()
                });
            }
            let step_started = Instant::now();
            let outcome = tokio::time::timeout(
                timeout,
                self.invoker.invoke(tenant_id, &step.target, step_params, &step_options),
            )
            .await;
            let duration_ms = step_started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

            execution.current_step_number = step.step_number;
            match outcome {
                Err(_elapsed) => {
                    warn!(pipeline = %pipeline.slug, step = step.step_number, "step timed out");
                    let error = InvocationError::new(
                        ErrorCode::StepTimeout,
                        format!("step {} ('{}') timed out after {:?}", step.step_number, step.slug, timeout),
                    );
                    execution.step_results.push(StepRecord {
                        step_number: step.step_number,
                        slug: step.slug.clone(),
                        status: StepState::TimedOut,
                        output: Value::Null,
                        cost_usd: 0.0,
                        tokens: 0,
                        duration_ms,
                        error: Some(error.clone()),
                    });
                    if step.fatal {
                        final_status = ExecutionStatus::Failed;
                        run_error = Some(error);
                        break;
                    }
                }
                Ok(result) => {
                    let cost_usd = result.metadata.cost_usd.unwrap_or(0.0);
                    let tokens = result.metadata.tokens.unwrap_or(0);
                    execution.total_cost_usd += cost_usd;
                    execution.total_tokens += tokens;

                    if result.success {
                        steps_context.insert(step.slug.clone(), result.data.clone());
                        execution.step_results.push(StepRecord {
                            step_number: step.step_number,
                            slug: step.slug.clone(),
                            status: StepState::Succeeded,
                            output: result.data,
                            cost_usd,
                            tokens,
                            duration_ms,
                            error: None,
                        });
                    } else {
                        let step_error = result.error.unwrap_or_else(|| {
                            InvocationError::new(ErrorCode::ExecutionFailed, "step failed without error details")
                        });
                        execution.step_results.push(StepRecord {
                            step_number: step.step_number,
                            slug: step.slug.clone(),
                            status: StepState::Failed,
                            output: Value::Null,
                            cost_usd,
                            tokens,
                            duration_ms,
                            error: Some(step_error.clone()),
                        });
                        if step.fatal {
                            final_status = ExecutionStatus::Failed;
                            run_error = Some(
                                InvocationError::new(
                                    ErrorCode::StepFailed,
                                    format!("step {} ('{}') failed: {}", step.step_number, step.slug, step_error.message),
                                )
                                .with_details(json!({
                                    "step_number": step.step_number,
                                    "step": step.slug,
                                    "cause": step_error.code.as_str(),
                                })),
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Cancellation requested during the last step still counts.
        if final_status == ExecutionStatus::Completed && cancel.is_cancelled() {
            final_status = ExecutionStatus::Cancelled;
            run_error = Some(InvocationError::new(
                ErrorCode::ExecutionCancelled,
                format!("pipeline '{}' cancelled", pipeline.slug),
            ));
        }

        execution.status = final_status;
        execution.completed_at = Some(self.clock.now());

        let data = if final_status == ExecutionStatus::Completed {
            self.map_output(pipeline, tenant_id, &params, options, &steps_context).await
        } else {
            outputs_value(&steps_context)
        };

        let error = run_error.map(|error| error.with_request_id(request_id));
        PipelineRun { execution, data, error }
    }

    async fn resolve_step_input(
        &self,
        step: &PipelineStep,
        params: &serde_json::Map<String, Value>,
        resolve_options: &ResolveOptions,
    ) -> Result<serde_json::Map<String, Value>, InvocationError> {
        let Some(template) = &step.input_mapping else {
            return Ok(params.clone());
        };

        let resolution = self.resolver.resolve(template, resolve_options).await.map_err(|error| match error {
            ResolveError::MissingVariables { missing } => InvocationError::new(
                ErrorCode::TemplateResolutionError,
                format!("step '{}' has unresolved input references", step.slug),
            )
            .with_details(json!({ "missing": missing })),
            ResolveError::Store(error) => {
                InvocationError::new(ErrorCode::ContextLoadFailed, format!("variable store failure: {error}"))
            }
        })?;

        match resolution.resolved {
            Value::Object(map) => Ok(map),
            other => Err(InvocationError::new(
                ErrorCode::TemplateResolutionError,
                format!("input mapping for step '{}' must resolve to an object, got {}", step.slug, other),
            )),
        }
    }

    /// Minimal condition language: `left == "right"` equality over resolved
    /// text, otherwise truthiness. Unresolved references are false.
    async fn eval_condition(&self, condition: &str, resolve_options: &ResolveOptions) -> bool {
        let mut lenient = resolve_options.clone();
        lenient.throw_on_missing = false;
        let resolved = match self.resolver.resolve_str(condition, &lenient).await {
            Ok(result) => result.resolved,
            Err(_) => return false,
        };
        let text = format_value(&resolved);
        if text.contains("${") {
            return false;
        }
        if let Some((left, right)) = text.split_once("==") {
            return left.trim().trim_matches('"') == right.trim().trim_matches('"');
        }
        let trimmed = text.trim();
        !(trimmed.is_empty() || trimmed == "false" || trimmed == "0")
    }

    async fn map_output(
        &self,
        pipeline: &Pipeline,
        tenant_id: &str,
        params: &serde_json::Map<String, Value>,
        options: &ExecutionOptions,
        steps_context: &HashMap<String, Value>,
    ) -> Value {
        let Some(template) = &pipeline.output_mapping else {
            return outputs_value(steps_context);
        };

        let resolve_options = ResolveOptions {
            tenant_id: tenant_id.to_string(),
            connection_id: options.connection_id.clone(),
            environment: options.environment.clone(),
            runtime_context: options.runtime_context.clone(),
            request_variables: merged_variables(params, &options.variables),
            reference_context: options.reference_context.clone(),
            step_outputs: steps_context.clone(),
            throw_on_missing: false,
        };
        match self.resolver.resolve(template, &resolve_options).await {
            Ok(result) => result.resolved,
            Err(error) => {
                warn!(pipeline = %pipeline.slug, %error, "output mapping failed; returning raw step outputs");
                outputs_value(steps_context)
            }
        }
    }
}

fn merged_variables(
    params: &serde_json::Map<String, Value>,
    overrides: &serde_json::Map<String, Value>,
) -> serde_json::Map<String, Value> {
    let mut merged = params.clone();
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

fn outputs_value(steps_context: &HashMap<String, Value>) -> Value {
    Value::Object(steps_context.iter().map(|(slug, output)| (slug.clone(), output.clone())).collect())
}

fn validate_definition(pipeline: &Pipeline) -> Result<(), InvocationError> {
    use conduit_types::PipelineStatus;

    match pipeline.status {
        PipelineStatus::Active => {}
        PipelineStatus::Draft => {
            return Err(InvocationError::new(
                ErrorCode::PipelineNotActive,
                format!("pipeline '{}' is a draft and cannot be invoked", pipeline.slug),
            ));
        }
        PipelineStatus::Disabled => {
            return Err(InvocationError::new(
                ErrorCode::PipelineDisabled,
                format!("pipeline '{}' is disabled", pipeline.slug),
            ));
        }
    }

    if pipeline.steps.is_empty() {
        return Err(InvocationError::new(
            ErrorCode::EmptyPipeline,
            format!("pipeline '{}' has no steps", pipeline.slug),
        ));
    }

    let mut numbers: Vec<u32> = pipeline.steps.iter().map(|step| step.step_number).collect();
    numbers.sort_unstable();
    for (index, number) in numbers.iter().enumerate() {
        if *number != index as u32 + 1 {
            return Err(InvocationError::new(
                ErrorCode::InvalidInput,
                format!("pipeline '{}' step numbers must be contiguous starting at 1", pipeline.slug),
            ));
        }
    }

    let mut slugs = std::collections::HashSet::new();
    for step in &pipeline.steps {
        if !slugs.insert(step.slug.as_str()) {
            return Err(InvocationError::new(
                ErrorCode::InvalidInput,
                format!("pipeline '{}' has duplicate step slug '{}'", pipeline.slug, step.slug),
            ));
        }
    }

    Ok(())
}
