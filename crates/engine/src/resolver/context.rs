//! Runtime context available to every invocation.
//!
//! Built fresh per call; `request.id` and `request.timestamp` are generated
//! when the caller does not supply them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::template::{VariableNamespace, VariableReference, navigate_value};

/// Caller identity forwarded by the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Connection summary exposed under `${connection.*}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// Request metadata exposed under `${request.*}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub environment: Option<String>,
}

/// Built-in variable context for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContext {
    #[serde(default)]
    pub current_user: Option<CurrentUser>,
    #[serde(default)]
    pub connection: Option<ConnectionInfo>,
    pub request: RequestInfo,
}

impl RuntimeContext {
    /// Creates a context with a generated request id and timestamp.
    pub fn new(environment: Option<String>) -> Self {
        Self {
            current_user: None,
            connection: None,
            request: RequestInfo {
                id: Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                environment,
            },
        }
    }

    /// Resolves a built-in reference against this context.
    ///
    /// Returns `None` for non-built-in namespaces, absent sections, and
    /// unknown paths.
    pub fn builtin_value(&self, reference: &VariableReference) -> Option<Value> {
        let section = match reference.namespace {
            VariableNamespace::CurrentUser => serde_json::to_value(self.current_user.as_ref()?).ok()?,
            VariableNamespace::Connection => serde_json::to_value(self.connection.as_ref()?).ok()?,
            VariableNamespace::Request => serde_json::to_value(&self.request).ok()?,
            _ => return None,
        };
        let value = navigate_value(&section, &reference.path)?.clone();
        if value.is_null() { None } else { Some(value) }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::template::VariableReference;

    #[test]
    fn generates_request_id_and_timestamp() {
        let context = RuntimeContext::new(Some("production".into()));
        assert!(!context.request.id.is_empty());
        assert_eq!(context.request.environment.as_deref(), Some("production"));

        let other = RuntimeContext::default();
        assert_ne!(context.request.id, other.request.id);
    }

    #[test]
    fn resolves_builtin_paths() {
        let mut context = RuntimeContext::default();
        context.current_user = Some(CurrentUser {
            id: "usr-1".into(),
            email: Some("dev@example.com".into()),
            name: None,
        });

        let id = context.builtin_value(&VariableReference::parse("current_user.id"));
        assert_eq!(id, Some(Value::String("usr-1".into())));

        let request_id = context.builtin_value(&VariableReference::parse("request.id"));
        assert!(request_id.is_some());
    }

    #[test]
    fn absent_sections_resolve_to_none() {
        let context = RuntimeContext::default();
        assert!(context.builtin_value(&VariableReference::parse("current_user.id")).is_none());
        assert!(context.builtin_value(&VariableReference::parse("connection.id")).is_none());
        // name is None on current_user even when the section exists
        let mut with_user = RuntimeContext::default();
        with_user.current_user = Some(CurrentUser {
            id: "usr-1".into(),
            email: None,
            name: None,
        });
        assert!(with_user.builtin_value(&VariableReference::parse("current_user.name")).is_none());
    }
}
