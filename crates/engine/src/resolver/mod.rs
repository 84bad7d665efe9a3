//! Layered `${...}` template resolution.
//!
//! A template (string or JSON tree) is resolved against an ordered list of
//! sources, highest priority first:
//!
//! 1. request variables supplied with the invocation
//! 2. request-supplied reference data (name→id, custom namespaces)
//! 3. prior step outputs (`steps.*`, pipelines only)
//! 4. connection-scoped stored variables
//! 5. tenant-scoped stored variables
//! 6. built-in runtime context (`current_user.*`, `connection.*`, `request.*`)
//!
//! The precedence list is walked explicitly in [`VariableResolver::lookup`],
//! so the order is testable on its own. Anything unresolved is reported in
//! [`ResolutionResult::missing`]; with `throw_on_missing` the whole
//! resolution fails instead.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_types::ReferenceItem;
use conduit_util::REDACTION_MARKER;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub mod context;
pub mod template;

pub use context::{ConnectionInfo, CurrentUser, RequestInfo, RuntimeContext};
pub use template::{VariableNamespace, VariableReference};

use crate::store::{StoredVariable, VariableStore};
use template::{collect_references, format_value, is_single_reference, navigate_value};

/// Which source layer produced a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionSource {
    /// Request variables, reference data, or step outputs.
    Runtime,
    /// Connection-scoped stored variable.
    Connection,
    /// Tenant-scoped stored variable.
    Tenant,
    /// Built-in runtime context field.
    Builtin,
    /// Nothing matched.
    Missing,
}

/// One reference with its resolution outcome.
#[derive(Debug, Clone)]
pub struct ResolvedVariable {
    pub reference: VariableReference,
    /// Resolved value; `Null` when missing.
    pub value: Value,
    pub source: ResolutionSource,
    pub found: bool,
    /// Sensitive values must be masked before leaving the engine.
    pub sensitive: bool,
}

/// Outcome of resolving one template.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    /// Template with references substituted.
    pub resolved: Value,
    /// One entry per distinct reference, in first-occurrence order.
    pub variables: Vec<ResolvedVariable>,
    /// References that no source could satisfy.
    pub missing: Vec<VariableReference>,
}

impl ResolutionResult {
    /// True when every reference resolved.
    pub fn all_found(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Outcome of validating a template without computing values.
#[derive(Debug, Clone)]
pub struct TemplateValidation {
    pub valid: bool,
    /// Expressions a source would satisfy.
    pub resolvable: Vec<String>,
    /// Expressions nothing would satisfy.
    pub unresolvable: Vec<String>,
}

/// Counts reported by [`summarize_resolution`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResolutionSummary {
    pub total: usize,
    pub found: usize,
    pub missing: usize,
    pub sensitive: usize,
    pub from_runtime: usize,
    pub from_connection: usize,
    pub from_tenant: usize,
    pub from_builtin: usize,
}

/// Inputs steering one resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub tenant_id: String,
    pub connection_id: Option<String>,
    pub environment: Option<String>,
    /// Caller-supplied runtime context; a fresh one (generated request id and
    /// timestamp) is used when absent.
    pub runtime_context: Option<RuntimeContext>,
    /// Highest-priority ad hoc overrides, keyed by expression or by the
    /// expression's first segment.
    pub request_variables: serde_json::Map<String, Value>,
    /// Reference data for name→id lookups, keyed by namespace.
    pub reference_context: HashMap<String, Vec<ReferenceItem>>,
    /// Prior step outputs, keyed by step slug (pipelines only).
    pub step_outputs: HashMap<String, Value>,
    /// Fail the whole resolution when any reference is unresolved.
    pub throw_on_missing: bool,
}

impl ResolveOptions {
    /// Options for a tenant with everything else defaulted.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }
}

/// Resolution failure.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// `throw_on_missing` was set and references were unresolved.
    #[error("unresolved template references: {}", missing.join(", "))]
    MissingVariables { missing: Vec<String> },
    /// The variable store collaborator failed.
    #[error("variable store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ResolveError {
    /// The missing expression list, empty for store failures.
    pub fn missing_paths(&self) -> &[String] {
        match self {
            ResolveError::MissingVariables { missing } => missing,
            ResolveError::Store(_) => &[],
        }
    }
}

struct LookupOutcome {
    value: Option<Value>,
    source: ResolutionSource,
    sensitive: bool,
}

/// Resolves templates against the layered source list.
#[derive(Clone)]
pub struct VariableResolver {
    variables: Arc<dyn VariableStore>,
}

impl VariableResolver {
    pub fn new(variables: Arc<dyn VariableStore>) -> Self {
        Self { variables }
    }

    /// Resolves a template value (string or tree).
    ///
    /// String templates keep unresolved spans as literal markers; inside
    /// object trees an unresolved single-reference leaf becomes `null`.
    pub async fn resolve(&self, template: &Value, options: &ResolveOptions) -> Result<ResolutionResult, ResolveError> {
        let runtime = effective_runtime(options);

        let mut references = Vec::new();
        collect_references(template, &mut references);

        let mut outcomes: IndexMap<String, LookupOutcome> = IndexMap::new();
        for reference in &references {
            if outcomes.contains_key(&reference.raw) {
                continue;
            }
            let outcome = self.lookup(reference, options, &runtime).await?;
            outcomes.insert(reference.raw.clone(), outcome);
        }

        let mut variables = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for reference in &references {
            if !seen.insert(reference.raw.clone()) {
                continue;
            }
            let outcome = &outcomes[&reference.raw];
            variables.push(ResolvedVariable {
                reference: reference.clone(),
                value: outcome.value.clone().unwrap_or(Value::Null),
                source: outcome.source,
                found: outcome.value.is_some(),
                sensitive: outcome.sensitive,
            });
        }

        let missing: Vec<VariableReference> = variables
            .iter()
            .filter(|variable| !variable.found)
            .map(|variable| variable.reference.clone())
            .collect();

        if options.throw_on_missing && !missing.is_empty() {
            return Err(ResolveError::MissingVariables {
                missing: missing.iter().map(|reference| reference.raw.clone()).collect(),
            });
        }

        let resolved = substitute_value(template, &outcomes, template.is_string());
        debug!(
            references = references.len(),
            missing = missing.len(),
            "template resolved"
        );

        Ok(ResolutionResult {
            resolved,
            variables,
            missing,
        })
    }

    /// Convenience wrapper for plain string templates.
    pub async fn resolve_str(&self, template: &str, options: &ResolveOptions) -> Result<ResolutionResult, ResolveError> {
        self.resolve(&Value::String(template.to_string()), options).await
    }

    /// Reports which references would resolve, without returning values.
    pub async fn validate(&self, template: &Value, options: &ResolveOptions) -> Result<TemplateValidation, ResolveError> {
        let runtime = effective_runtime(options);

        let mut references = Vec::new();
        collect_references(template, &mut references);

        let mut resolvable = Vec::new();
        let mut unresolvable = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for reference in &references {
            if !seen.insert(reference.raw.clone()) {
                continue;
            }
            let outcome = self.lookup(reference, options, &runtime).await?;
            if outcome.value.is_some() {
                resolvable.push(reference.raw.clone());
            } else {
                unresolvable.push(reference.raw.clone());
            }
        }

        Ok(TemplateValidation {
            valid: unresolvable.is_empty(),
            resolvable,
            unresolvable,
        })
    }

    /// Walks the ordered source list for one reference.
    async fn lookup(
        &self,
        reference: &VariableReference,
        options: &ResolveOptions,
        runtime: &RuntimeContext,
    ) -> Result<LookupOutcome, ResolveError> {
        // 1. Request variables: exact expression key, then object walk from
        //    the first segment.
        if let Some(value) = request_variable(reference, &options.request_variables) {
            return Ok(LookupOutcome {
                value: Some(value),
                source: ResolutionSource::Runtime,
                sensitive: false,
            });
        }

        // 2. Reference data: name→id for custom namespaces.
        if let VariableNamespace::Custom(namespace) = &reference.namespace
            && let Some(items) = options.reference_context.get(namespace)
            && let Some(item) = items.iter().find(|item| item.name == reference.path)
        {
            return Ok(LookupOutcome {
                value: Some(Value::String(item.id.clone())),
                source: ResolutionSource::Runtime,
                sensitive: false,
            });
        }

        // 3. Step outputs (pipelines).
        if reference.namespace == VariableNamespace::Steps
            && let Some(value) = step_output_value(reference, &options.step_outputs)
        {
            return Ok(LookupOutcome {
                value: Some(value),
                source: ResolutionSource::Runtime,
                sensitive: false,
            });
        }

        // 4. Connection-scoped stored variables.
        if let Some(connection_id) = options.connection_id.as_deref()
            && let Some(stored) = self.variables.connection_variable(connection_id, &reference.raw).await?
        {
            return Ok(stored_outcome(stored, ResolutionSource::Connection));
        }

        // 5. Tenant-scoped stored variables.
        if let Some(stored) = self.variables.tenant_variable(&options.tenant_id, &reference.raw).await? {
            return Ok(stored_outcome(stored, ResolutionSource::Tenant));
        }

        // 6. Built-in runtime context.
        if let Some(value) = runtime.builtin_value(reference) {
            return Ok(LookupOutcome {
                value: Some(value),
                source: ResolutionSource::Builtin,
                sensitive: false,
            });
        }

        Ok(LookupOutcome {
            value: None,
            source: ResolutionSource::Missing,
            sensitive: false,
        })
    }
}

fn effective_runtime(options: &ResolveOptions) -> RuntimeContext {
    options
        .runtime_context
        .clone()
        .unwrap_or_else(|| RuntimeContext::new(options.environment.clone()))
}

fn stored_outcome(stored: StoredVariable, source: ResolutionSource) -> LookupOutcome {
    LookupOutcome {
        value: Some(stored.value),
        source,
        sensitive: stored.sensitive,
    }
}

fn request_variable(reference: &VariableReference, request_variables: &serde_json::Map<String, Value>) -> Option<Value> {
    if let Some(value) = request_variables.get(&reference.raw) {
        return Some(value.clone());
    }
    let (head, rest) = match reference.raw.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => return None,
    };
    let root = request_variables.get(head)?;
    navigate_value(root, rest).cloned()
}

fn step_output_value(reference: &VariableReference, step_outputs: &HashMap<String, Value>) -> Option<Value> {
    let (slug, rest) = match reference.path.split_once('.') {
        Some((slug, rest)) => (slug, rest),
        None => (reference.path.as_str(), ""),
    };
    let output = step_outputs.get(slug)?;
    // Allow an explicit `output` segment for clarity.
    let path = rest.strip_prefix("output").map(|p| p.trim_start_matches('.')).unwrap_or(rest);
    navigate_value(output, path).cloned()
}

fn substitute_value(template: &Value, outcomes: &IndexMap<String, LookupOutcome>, string_template: bool) -> Value {
    match template {
        Value::String(text) => substitute_string(text, outcomes, !string_template),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, outcomes, false))
                .collect(),
        ),
        Value::Object(map) => {
            let mut substituted = serde_json::Map::new();
            for (key, value) in map {
                substituted.insert(key.clone(), substitute_value(value, outcomes, false));
            }
            Value::Object(substituted)
        }
        other => other.clone(),
    }
}

fn substitute_string(text: &str, outcomes: &IndexMap<String, LookupOutcome>, null_on_missing: bool) -> Value {
    if is_single_reference(text) {
        let reference = VariableReference::parse(&text.trim()[2..text.trim().len() - 1]);
        return match outcomes.get(&reference.raw).and_then(|outcome| outcome.value.clone()) {
            Some(value) => value,
            None if null_on_missing => Value::Null,
            None => Value::String(reference.marker()),
        };
    }

    let mut output = String::new();
    let mut remainder = text;
    while let Some(start) = remainder.find("${") {
        let (before, after) = remainder.split_at(start);
        output.push_str(before);
        let Some(end) = after.find('}') else {
            output.push_str(after);
            return Value::String(output);
        };
        let expression = after[2..end].trim();
        match outcomes.get(expression).and_then(|outcome| outcome.value.as_ref()) {
            Some(value) => output.push_str(&format_value(value)),
            None => output.push_str(&after[..end + 1]),
        }
        remainder = &after[end + 1..];
    }
    output.push_str(remainder);
    Value::String(output)
}

/// Replaces every sensitive resolved value in the result with the redaction
/// marker.
///
/// This is the transform callers apply before a resolved template leaves the
/// resolver's trust boundary (previews, logs, `resolved_inputs` metadata).
pub fn mask_sensitive_values(result: &ResolutionResult) -> Value {
    let sensitive: Vec<String> = result
        .variables
        .iter()
        .filter(|variable| variable.sensitive && variable.found)
        .map(|variable| format_value(&variable.value))
        .filter(|text| !text.is_empty())
        .collect();
    if sensitive.is_empty() {
        return result.resolved.clone();
    }
    mask_value(&result.resolved, &sensitive)
}

fn mask_value(value: &Value, sensitive: &[String]) -> Value {
    match value {
        Value::String(text) => {
            let mut masked = text.clone();
            for secret in sensitive {
                masked = masked.replace(secret.as_str(), REDACTION_MARKER);
            }
            Value::String(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| mask_value(item, sensitive)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, nested)| (key.clone(), mask_value(nested, sensitive)))
                .collect(),
        ),
        other if sensitive.contains(&format_value(other)) => Value::String(REDACTION_MARKER.to_string()),
        other => other.clone(),
    }
}

/// Pure reporting helper: counts by source, found-ness, and sensitivity.
pub fn summarize_resolution(result: &ResolutionResult) -> ResolutionSummary {
    let mut summary = ResolutionSummary {
        total: result.variables.len(),
        ..ResolutionSummary::default()
    };
    for variable in &result.variables {
        if variable.found {
            summary.found += 1;
        } else {
            summary.missing += 1;
        }
        if variable.sensitive {
            summary.sensitive += 1;
        }
        match variable.source {
            ResolutionSource::Runtime => summary.from_runtime += 1,
            ResolutionSource::Connection => summary.from_connection += 1,
            ResolutionSource::Tenant => summary.from_tenant += 1,
            ResolutionSource::Builtin => summary.from_builtin += 1,
            ResolutionSource::Missing => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn resolver_with(store: MemoryStore) -> VariableResolver {
        VariableResolver::new(Arc::new(store))
    }

    fn options() -> ResolveOptions {
        ResolveOptions::for_tenant("tenant-a")
    }

    #[tokio::test]
    async fn templates_without_references_pass_through() {
        let resolver = resolver_with(MemoryStore::new());
        let result = resolver.resolve_str("no references here", &options()).await.unwrap();
        assert_eq!(result.resolved, json!("no references here"));
        assert!(result.all_found());
        assert!(result.missing.is_empty());
        assert!(result.variables.is_empty());
    }

    #[tokio::test]
    async fn resolution_is_idempotent_for_resolvable_templates() {
        let mut store = MemoryStore::new();
        store.add_tenant_variable("tenant-a", "region", StoredVariable::plain("eu-west"));
        let resolver = resolver_with(store);

        let first = resolver.resolve_str("deploy to ${region}", &options()).await.unwrap();
        let second = resolver.resolve_str("deploy to ${region}", &options()).await.unwrap();
        assert_eq!(first.resolved, second.resolved);
        assert_eq!(first.resolved, json!("deploy to eu-west"));
    }

    #[tokio::test]
    async fn request_variables_outrank_stored_and_builtin_sources() {
        let mut store = MemoryStore::new();
        store.add_tenant_variable("tenant-a", "region", StoredVariable::plain("tenant-value"));
        store.add_connection_variable("conn-1", "region", StoredVariable::plain("connection-value"));
        let resolver = resolver_with(store);

        let mut opts = options();
        opts.connection_id = Some("conn-1".into());

        // connection beats tenant
        let result = resolver.resolve_str("${region}", &opts).await.unwrap();
        assert_eq!(result.resolved, json!("connection-value"));
        assert_eq!(result.variables[0].source, ResolutionSource::Connection);

        // request beats connection
        opts.request_variables.insert("region".into(), json!("request-value"));
        let result = resolver.resolve_str("${region}", &opts).await.unwrap();
        assert_eq!(result.resolved, json!("request-value"));
        assert_eq!(result.variables[0].source, ResolutionSource::Runtime);
    }

    #[tokio::test]
    async fn builtin_context_resolves_and_reports_source() {
        let resolver = resolver_with(MemoryStore::new());
        let mut opts = options();
        let mut runtime = RuntimeContext::default();
        runtime.current_user = Some(CurrentUser {
            id: "usr-7".into(),
            email: None,
            name: None,
        });
        opts.runtime_context = Some(runtime);

        let result = resolver.resolve_str("${current_user.id}", &opts).await.unwrap();
        assert_eq!(result.resolved, json!("usr-7"));
        assert_eq!(result.variables[0].source, ResolutionSource::Builtin);
    }

    #[tokio::test]
    async fn missing_current_user_is_lenient_by_default() {
        let resolver = resolver_with(MemoryStore::new());
        let result = resolver.resolve_str("${current_user.id}", &options()).await.unwrap();
        assert!(!result.all_found());
        assert_eq!(result.missing[0].raw, "current_user.id");
        // string templates keep the literal marker
        assert_eq!(result.resolved, json!("${current_user.id}"));
    }

    #[tokio::test]
    async fn missing_reference_fails_in_strict_mode() {
        let resolver = resolver_with(MemoryStore::new());
        let mut opts = options();
        opts.throw_on_missing = true;

        let error = resolver.resolve_str("${current_user.id}", &opts).await.unwrap_err();
        match error {
            ResolveError::MissingVariables { missing } => assert_eq!(missing, vec!["current_user.id".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn object_tree_leaves_null_out_missing_references() {
        let resolver = resolver_with(MemoryStore::new());
        let template = json!({"user": "${current_user.id}", "note": "for ${current_user.id}"});
        let result = resolver.resolve(&template, &options()).await.unwrap();
        assert_eq!(result.resolved["user"], Value::Null);
        // mixed strings keep the marker text
        assert_eq!(result.resolved["note"], json!("for ${current_user.id}"));
    }

    #[tokio::test]
    async fn reference_context_maps_names_to_ids() {
        let resolver = resolver_with(MemoryStore::new());
        let mut opts = options();
        opts.reference_context.insert(
            "channels".into(),
            vec![ReferenceItem {
                id: "C123".into(),
                name: "general".into(),
                metadata: None,
            }],
        );

        let result = resolver.resolve_str("${channels.general}", &opts).await.unwrap();
        assert_eq!(result.resolved, json!("C123"));
    }

    #[tokio::test]
    async fn step_outputs_resolve_with_and_without_output_segment() {
        let resolver = resolver_with(MemoryStore::new());
        let mut opts = options();
        opts.step_outputs
            .insert("create_user".into(), json!({"id": "usr-1", "items": [{"id": "a"}]}));

        let plain = resolver.resolve_str("${steps.create_user.id}", &opts).await.unwrap();
        assert_eq!(plain.resolved, json!("usr-1"));

        let with_output = resolver.resolve_str("${steps.create_user.output.id}", &opts).await.unwrap();
        assert_eq!(with_output.resolved, json!("usr-1"));

        let indexed = resolver
            .resolve_str("${steps.create_user.output.items[0].id}", &opts)
            .await
            .unwrap();
        assert_eq!(indexed.resolved, json!("a"));
    }

    #[tokio::test]
    async fn masking_replaces_sensitive_values_everywhere() {
        let mut store = MemoryStore::new();
        store.add_tenant_variable("tenant-a", "api_token", StoredVariable::secret("sk-very-secret"));
        let resolver = resolver_with(store);

        let template = json!({"header": "Bearer ${api_token}", "token": "${api_token}"});
        let result = resolver.resolve(&template, &options()).await.unwrap();
        assert!(result.variables[0].sensitive);

        let masked = mask_sensitive_values(&result);
        let rendered = masked.to_string();
        assert!(!rendered.contains("sk-very-secret"), "got: {rendered}");
        assert_eq!(masked["token"], json!("<redacted>"));
    }

    #[tokio::test]
    async fn validate_reports_resolvability_without_values() {
        let mut store = MemoryStore::new();
        store.add_tenant_variable("tenant-a", "region", StoredVariable::plain("eu"));
        let resolver = resolver_with(store);

        let template = json!("${region} ${current_user.id}");
        let validation = resolver.validate(&template, &options()).await.unwrap();
        assert!(!validation.valid);
        assert_eq!(validation.resolvable, vec!["region".to_string()]);
        assert_eq!(validation.unresolvable, vec!["current_user.id".to_string()]);
    }

    #[tokio::test]
    async fn summary_counts_by_source_and_sensitivity() {
        let mut store = MemoryStore::new();
        store.add_tenant_variable("tenant-a", "token", StoredVariable::secret("s3cret"));
        let resolver = resolver_with(store);

        let template = json!("${token} ${request.id} ${nope}");
        let result = resolver.resolve(&template, &options()).await.unwrap();
        let summary = summarize_resolution(&result);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.found, 2);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.sensitive, 1);
        assert_eq!(summary.from_tenant, 1);
        assert_eq!(summary.from_builtin, 1);
    }
}
