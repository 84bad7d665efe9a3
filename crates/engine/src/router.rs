//! Composite tool routing: pick one operation, map parameters, invoke it.
//!
//! Rule-based tools evaluate their rules in ascending priority order and
//! short-circuit on the first match. Agent-driven tools delegate the choice
//! to an [`OperationPicker`] under its own timeout. Either way the selected
//! operation's input template is resolved before the gateway is called;
//! mapping failures never reach the network.

use std::sync::Arc;
use std::time::Duration;

use conduit_types::{
    CompositeTool, ConditionType, ErrorCode, InvocationError, InvocationResult, Operation, RoutingInfo,
    RoutingMode, RoutingRule,
};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::gateway::{ActionGateway, InvokeOptions};
use crate::llm::OperationPicker;
use crate::resolver::{ResolveError, ResolveOptions, VariableResolver};
use crate::resolver::template::{format_value, navigate_value};

/// Router tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Timeout for the agent routing decision, independent of the action
    /// call it leads to.
    pub agent_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(20),
        }
    }
}

/// Why an operation was selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub operation_slug: String,
    pub reason: String,
}

/// Routes composite tool invocations to one of their operations.
pub struct CompositeToolRouter {
    gateway: Arc<ActionGateway>,
    resolver: VariableResolver,
    picker: Option<Arc<dyn OperationPicker>>,
    config: RouterConfig,
}

impl CompositeToolRouter {
    pub fn new(
        gateway: Arc<ActionGateway>,
        resolver: VariableResolver,
        picker: Option<Arc<dyn OperationPicker>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            gateway,
            resolver,
            picker,
            config,
        }
    }

    /// Decides which operation the tool should invoke for these params.
    pub async fn route(
        &self,
        tool: &CompositeTool,
        params: &serde_json::Map<String, Value>,
    ) -> Result<RouteDecision, InvocationError> {
        if !tool.enabled {
            return Err(InvocationError::new(
                ErrorCode::CompositeToolDisabled,
                format!("composite tool '{}' is disabled", tool.slug),
            ));
        }

        match &tool.routing {
            RoutingMode::Rules { rules } => self.route_by_rules(tool, rules, params),
            RoutingMode::Agent { instructions } => self.route_by_agent(tool, instructions.as_deref(), params).await,
        }
    }

    fn route_by_rules(
        &self,
        tool: &CompositeTool,
        rules: &[RoutingRule],
        params: &serde_json::Map<String, Value>,
    ) -> Result<RouteDecision, InvocationError> {
        let params_value = Value::Object(params.clone());
        let mut ordered: Vec<&RoutingRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| rule.priority);

        for rule in ordered {
            if rule_matches(rule, &params_value) {
                debug!(tool = %tool.slug, operation = %rule.operation_slug, priority = rule.priority, "routing rule matched");
                return Ok(RouteDecision {
                    operation_slug: rule.operation_slug.clone(),
                    reason: format!(
                        "rule (priority {}): {} {:?} {:?}",
                        rule.priority, rule.condition_field, rule.condition_type, rule.condition_value
                    ),
                });
            }
        }

        if let Some(default) = &tool.default_operation {
            return Ok(RouteDecision {
                operation_slug: default.clone(),
                reason: "default operation (no rule matched)".to_string(),
            });
        }

        Err(InvocationError::new(
            ErrorCode::RoutingFailed,
            format!("no routing rule matched for tool '{}' and no default operation is configured", tool.slug),
        ))
    }

    async fn route_by_agent(
        &self,
        tool: &CompositeTool,
        instructions: Option<&str>,
        params: &serde_json::Map<String, Value>,
    ) -> Result<RouteDecision, InvocationError> {
        let picker = self.picker.as_ref().ok_or_else(|| {
            InvocationError::new(
                ErrorCode::RoutingFailed,
                format!("tool '{}' uses agent routing but no routing agent is configured", tool.slug),
            )
        })?;

        let prompt = routing_prompt(tool, instructions, params);
        let picked = tokio::time::timeout(self.config.agent_timeout, picker.pick_operation(&prompt))
            .await
            .map_err(|_| InvocationError::new(ErrorCode::RoutingFailed, "agent routing decision timed out"))?
            .map_err(|error| InvocationError::new(ErrorCode::RoutingFailed, format!("agent routing failed: {error}")))?;

        let slug = picked.trim();
        if tool.operation(slug).is_none() {
            return Err(InvocationError::new(
                ErrorCode::RoutingFailed,
                format!("agent selected unknown operation '{slug}' for tool '{}'", tool.slug),
            )
            .with_details(json!({ "selected": slug })));
        }

        Ok(RouteDecision {
            operation_slug: slug.to_string(),
            reason: "selected by routing agent".to_string(),
        })
    }

    /// Routes and invokes a composite tool, attaching routing metadata to the
    /// envelope.
    pub async fn invoke(
        &self,
        tenant_id: &str,
        tool: &CompositeTool,
        params: serde_json::Map<String, Value>,
        options: &InvokeOptions,
    ) -> InvocationResult {
        let decision = match self.route(tool, &params).await {
            Ok(decision) => decision,
            Err(error) => return InvocationResult::err(error, Default::default()),
        };

        let operation = match tool.operation(&decision.operation_slug) {
            Some(operation) => operation,
            None => {
                return InvocationResult::err(
                    InvocationError::new(
                        ErrorCode::RoutingFailed,
                        format!(
                            "routing selected operation '{}' which does not exist on tool '{}'",
                            decision.operation_slug, tool.slug
                        ),
                    ),
                    Default::default(),
                );
            }
        };

        let mapped = match self.map_parameters(tenant_id, operation, &params, options).await {
            Ok(mapped) => mapped,
            Err(error) => return InvocationResult::err(error, Default::default()),
        };

        let mut result = self
            .gateway
            .invoke(tenant_id, &operation.integration_slug, &operation.action_slug, mapped, options)
            .await;
        result.metadata.routing = Some(RoutingInfo {
            operation_slug: decision.operation_slug,
            reason: decision.reason,
        });
        result
    }

    /// Resolves the operation's input template against the caller params.
    async fn map_parameters(
        &self,
        tenant_id: &str,
        operation: &Operation,
        params: &serde_json::Map<String, Value>,
        options: &InvokeOptions,
    ) -> Result<serde_json::Map<String, Value>, InvocationError> {
        let Some(template) = &operation.input_template else {
            return Ok(params.clone());
        };

        let resolve_options = ResolveOptions {
            tenant_id: tenant_id.to_string(),
            connection_id: options.connection_id.clone(),
            environment: options.environment.clone(),
            runtime_context: options.runtime_context.clone(),
            request_variables: params.clone(),
            reference_context: options.reference_context.clone(),
            step_outputs: Default::default(),
            throw_on_missing: true,
        };

        let resolution = self.resolver.resolve(template, &resolve_options).await.map_err(|error| match error {
            ResolveError::MissingVariables { missing } => InvocationError::new(
                ErrorCode::ParameterMappingFailed,
                format!("could not map parameters for operation '{}'", operation.slug),
            )
            .with_details(json!({ "missing": missing })),
            ResolveError::Store(error) => {
                InvocationError::new(ErrorCode::ContextLoadFailed, format!("variable store failure: {error}"))
            }
        })?;

        match resolution.resolved {
            Value::Object(map) => Ok(map),
            other => Err(InvocationError::new(
                ErrorCode::ParameterMappingFailed,
                format!(
                    "input template for operation '{}' must resolve to an object, got {}",
                    operation.slug,
                    type_name(&other)
                ),
            )),
        }
    }
}

fn routing_prompt(tool: &CompositeTool, instructions: Option<&str>, params: &serde_json::Map<String, Value>) -> String {
    let mut ordered: Vec<&Operation> = tool.operations.iter().collect();
    ordered.sort_by_key(|operation| operation.priority);

    let mut prompt = String::new();
    if let Some(instructions) = instructions {
        prompt.push_str(instructions);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Available operations:\n");
    for operation in ordered {
        prompt.push_str("- ");
        prompt.push_str(&operation.slug);
        if let Some(description) = &operation.description {
            prompt.push_str(": ");
            prompt.push_str(description);
        }
        prompt.push('\n');
    }
    prompt.push_str("\nRequest parameters:\n");
    prompt.push_str(&Value::Object(params.clone()).to_string());
    prompt.push_str("\n\nReply with exactly one operation slug from the list.");
    prompt
}

fn rule_matches(rule: &RoutingRule, params: &Value) -> bool {
    let Some(field_value) = navigate_value(params, &rule.condition_field) else {
        return false;
    };
    let actual = format_value(field_value);

    match rule.condition_type {
        ConditionType::Matches => {
            let pattern = if rule.case_sensitive {
                rule.condition_value.clone()
            } else {
                format!("(?i){}", rule.condition_value)
            };
            match Regex::new(&pattern) {
                Ok(regex) => regex.is_match(&actual),
                Err(error) => {
                    warn!(pattern = %rule.condition_value, %error, "invalid routing rule regex; rule skipped");
                    false
                }
            }
        }
        _ => {
            let (actual, expected) = if rule.case_sensitive {
                (actual, rule.condition_value.clone())
            } else {
                (actual.to_lowercase(), rule.condition_value.to_lowercase())
            };
            match rule.condition_type {
                ConditionType::Contains => actual.contains(&expected),
                ConditionType::Equals => actual == expected,
                ConditionType::StartsWith => actual.starts_with(&expected),
                ConditionType::EndsWith => actual.ends_with(&expected),
                ConditionType::Matches => unreachable!("handled above"),
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::{
        ActionTransport, BreakerConfig, GatewayConfig, PreparedCall, RetryPolicy, TransportError, UpstreamResponse,
    };
    use crate::store::{MemoryLogSink, MemoryStore};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use conduit_types::{ActionSpec, AuthScheme, Credential, Integration};
    use indexmap::IndexMap;
    use std::sync::Mutex;

    struct EchoTransport {
        calls: Mutex<Vec<PreparedCall>>,
    }

    impl EchoTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: Mutex::new(vec![]) })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_call(&self) -> PreparedCall {
            self.calls.lock().unwrap().last().cloned().expect("a call")
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
                body: r#"{"ok":true}"#.to_string(),
            })
        }
    }

    struct FixedPicker {
        answer: Result<String, String>,
        delay: Duration,
    }

    #[async_trait]
    impl OperationPicker for FixedPicker {
        async fn pick_operation(&self, _prompt: &str) -> anyhow::Result<String> {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            self.answer.clone().map_err(|message| anyhow!(message))
        }
    }

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_integration(Integration {
            id: "int-slack".into(),
            tenant_id: "tenant-a".into(),
            slug: "slack".into(),
            name: "Slack".into(),
            base_url: "https://slack.example.com".into(),
            auth: AuthScheme::Bearer,
            enabled: true,
        });
        for slug in ["send_dm", "post_channel"] {
            store.add_action(ActionSpec {
                id: format!("act-{slug}"),
                integration_slug: "slack".into(),
                slug: slug.into(),
                name: slug.into(),
                method: "POST".into(),
                path: "/api".into(),
                headers: IndexMap::new(),
                query: IndexMap::new(),
                body_template: None,
                enabled: true,
                timeout_seconds: None,
            });
        }
        store.add_credential(Credential {
            id: "cred-1".into(),
            integration_id: "int-slack".into(),
            connection_id: None,
            external_user_id: None,
            username: None,
            secret: "tok".into(),
            active: true,
        });
        store
    }

    fn router_with(picker: Option<Arc<dyn OperationPicker>>, transport: Arc<EchoTransport>) -> CompositeToolRouter {
        let store = Arc::new(store());
        let resolver = VariableResolver::new(store.clone());
        let gateway = Arc::new(ActionGateway::new(
            store.clone(),
            store,
            resolver.clone(),
            transport,
            Arc::new(MemoryLogSink::new()),
            Arc::new(ManualClock::new(chrono::Utc::now())),
            GatewayConfig {
                default_timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    max_attempts: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                breaker: BreakerConfig::default(),
            },
        ));
        CompositeToolRouter::new(
            gateway,
            resolver,
            picker,
            RouterConfig {
                agent_timeout: Duration::from_millis(100),
            },
        )
    }

    fn operation(slug: &str) -> Operation {
        Operation {
            slug: slug.into(),
            description: Some(format!("{slug} operation")),
            integration_slug: "slack".into(),
            action_slug: slug.into(),
            priority: 0,
            input_template: None,
        }
    }

    fn rule_tool(rules: Vec<RoutingRule>, default_operation: Option<&str>) -> CompositeTool {
        CompositeTool {
            id: "tool-1".into(),
            tenant_id: "tenant-a".into(),
            slug: "messenger".into(),
            name: "Messenger".into(),
            enabled: true,
            routing: RoutingMode::Rules { rules },
            default_operation: default_operation.map(Into::into),
            operations: vec![operation("send_dm"), operation("post_channel")],
        }
    }

    fn rule(priority: i32, operation_slug: &str, condition_type: ConditionType, field: &str, value: &str) -> RoutingRule {
        RoutingRule {
            operation_slug: operation_slug.into(),
            condition_type,
            condition_field: field.into(),
            condition_value: value.into(),
            case_sensitive: true,
            priority,
        }
    }

    fn params(entries: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        entries.iter().map(|(name, value)| (name.to_string(), value.clone())).collect()
    }

    #[tokio::test]
    async fn first_matching_rule_wins_by_priority() {
        let router = router_with(None, EchoTransport::new());
        let tool = rule_tool(
            vec![
                rule(2, "post_channel", ConditionType::Contains, "url", "/"),
                rule(1, "send_dm", ConditionType::Contains, "url", "/users"),
            ],
            None,
        );

        let decision = router.route(&tool, &params(&[("url", json!("/users/5"))])).await.unwrap();
        assert_eq!(decision.operation_slug, "send_dm");
        assert!(decision.reason.contains("priority 1"));
    }

    #[tokio::test]
    async fn falls_back_to_the_default_operation() {
        let router = router_with(None, EchoTransport::new());
        let tool = rule_tool(
            vec![rule(1, "send_dm", ConditionType::Contains, "url", "/users")],
            Some("post_channel"),
        );

        let decision = router.route(&tool, &params(&[("url", json!("/orders"))])).await.unwrap();
        assert_eq!(decision.operation_slug, "post_channel");
        assert!(decision.reason.contains("default"));
    }

    #[tokio::test]
    async fn no_match_and_no_default_is_a_routing_failure() {
        let router = router_with(None, EchoTransport::new());
        let tool = rule_tool(vec![rule(1, "send_dm", ConditionType::Contains, "url", "/users")], None);

        let error = router.route(&tool, &params(&[("url", json!("/orders"))])).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::RoutingFailed);
    }

    #[tokio::test]
    async fn condition_types_and_case_sensitivity() {
        let value = json!({"target": "@Alice", "kind": "Direct-Message", "count": 3});

        assert!(rule_matches(&rule(1, "x", ConditionType::StartsWith, "target", "@"), &value));
        assert!(rule_matches(&rule(1, "x", ConditionType::EndsWith, "kind", "Message"), &value));
        assert!(rule_matches(&rule(1, "x", ConditionType::Equals, "count", "3"), &value));
        assert!(rule_matches(&rule(1, "x", ConditionType::Matches, "kind", "^Direct-"), &value));

        // case sensitive by default
        assert!(!rule_matches(&rule(1, "x", ConditionType::Contains, "kind", "direct"), &value));
        let mut insensitive = rule(1, "x", ConditionType::Contains, "kind", "direct");
        insensitive.case_sensitive = false;
        assert!(rule_matches(&insensitive, &value));

        let mut insensitive_regex = rule(1, "x", ConditionType::Matches, "kind", "^direct-");
        insensitive_regex.case_sensitive = false;
        assert!(rule_matches(&insensitive_regex, &value));

        // absent fields never match
        assert!(!rule_matches(&rule(1, "x", ConditionType::Contains, "missing", "x"), &value));
        // dot paths reach nested fields
        let nested = json!({"message": {"channel": "general"}});
        assert!(rule_matches(&rule(1, "x", ConditionType::Equals, "message.channel", "general"), &nested));
    }

    #[tokio::test]
    async fn invalid_regex_rules_are_skipped() {
        let value = json!({"kind": "anything"});
        assert!(!rule_matches(&rule(1, "x", ConditionType::Matches, "kind", "("), &value));
    }

    #[tokio::test]
    async fn disabled_tool_short_circuits_before_routing() {
        let router = router_with(None, EchoTransport::new());
        let mut tool = rule_tool(vec![], Some("send_dm"));
        tool.enabled = false;

        let error = router.route(&tool, &params(&[])).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::CompositeToolDisabled);
    }

    fn agent_tool() -> CompositeTool {
        CompositeTool {
            routing: RoutingMode::Agent { instructions: None },
            ..rule_tool(vec![], None)
        }
    }

    #[tokio::test]
    async fn agent_routing_accepts_a_known_slug() {
        let picker = Arc::new(FixedPicker {
            answer: Ok("send_dm".into()),
            delay: Duration::ZERO,
        });
        let router = router_with(Some(picker), EchoTransport::new());

        let decision = router.route(&agent_tool(), &params(&[("text", json!("hi"))])).await.unwrap();
        assert_eq!(decision.operation_slug, "send_dm");
    }

    #[tokio::test]
    async fn agent_routing_rejects_unknown_slugs() {
        let picker = Arc::new(FixedPicker {
            answer: Ok("made_up_operation".into()),
            delay: Duration::ZERO,
        });
        let router = router_with(Some(picker), EchoTransport::new());

        let error = router.route(&agent_tool(), &params(&[])).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::RoutingFailed);
    }

    #[tokio::test]
    async fn agent_routing_times_out_independently() {
        let picker = Arc::new(FixedPicker {
            answer: Ok("send_dm".into()),
            delay: Duration::from_millis(500),
        });
        let router = router_with(Some(picker), EchoTransport::new());

        let error = router.route(&agent_tool(), &params(&[])).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::RoutingFailed);
        assert!(error.message.contains("timed out"));
    }

    #[tokio::test]
    async fn invoke_maps_parameters_and_attaches_routing_metadata() {
        let transport = EchoTransport::new();
        let router = router_with(None, transport.clone());
        let mut tool = rule_tool(
            vec![rule(1, "send_dm", ConditionType::StartsWith, "target", "@")],
            None,
        );
        tool.operations[0].input_template = Some(json!({
            "user": "${target}",
            "text": "${text}",
        }));

        let result = router
            .invoke(
                "tenant-a",
                &tool,
                params(&[("target", json!("@alice")), ("text", json!("hello"))]),
                &InvokeOptions::default(),
            )
            .await;
        assert!(result.success, "error: {:?}", result.error);

        let routing = result.metadata.routing.unwrap();
        assert_eq!(routing.operation_slug, "send_dm");

        let body = transport.last_call().body.unwrap();
        assert_eq!(body["user"], json!("@alice"));
        assert_eq!(body["text"], json!("hello"));
    }

    #[tokio::test]
    async fn parameter_mapping_failure_never_reaches_the_gateway() {
        let transport = EchoTransport::new();
        let router = router_with(None, transport.clone());
        let mut tool = rule_tool(vec![], Some("send_dm"));
        tool.operations[0].input_template = Some(json!({"user": "${target}"}));

        let result = router.invoke("tenant-a", &tool, params(&[]), &InvokeOptions::default()).await;
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::ParameterMappingFailed);
        assert_eq!(error.details.unwrap()["missing"], json!(["target"]));
        assert_eq!(transport.call_count(), 0);
    }
}
