//! Template parsing and JSON path navigation.
//!
//! Templates contain zero or more `${namespace.path}` references. Parsing is
//! side-effect free; resolution lives in the parent module.

use serde_json::Value;

/// Namespace a variable reference belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableNamespace {
    /// `${current_user.*}` built-in runtime context.
    CurrentUser,
    /// `${connection.*}` built-in runtime context.
    Connection,
    /// `${request.*}` built-in runtime context.
    Request,
    /// `${steps.<slug>.output.*}` prior step outputs (pipelines only).
    Steps,
    /// Anything else: tenant/connection-scoped named variables or
    /// request-supplied reference data.
    Custom(String),
}

impl VariableNamespace {
    fn parse(segment: &str) -> Self {
        match segment {
            "current_user" => VariableNamespace::CurrentUser,
            "connection" => VariableNamespace::Connection,
            "request" => VariableNamespace::Request,
            "steps" => VariableNamespace::Steps,
            other => VariableNamespace::Custom(other.to_string()),
        }
    }
}

/// One parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableReference {
    /// Expression without delimiters, e.g. `current_user.id`.
    pub raw: String,
    /// Namespace derived from the first dot-segment.
    pub namespace: VariableNamespace,
    /// Remainder after the namespace segment (may be empty).
    pub path: String,
}

impl VariableReference {
    /// Parses a single expression (no `${}` delimiters).
    pub fn parse(expression: &str) -> Self {
        let trimmed = expression.trim();
        let (head, rest) = match trimmed.split_once('.') {
            Some((head, rest)) => (head, rest),
            None => (trimmed, ""),
        };
        Self {
            raw: trimmed.to_string(),
            namespace: VariableNamespace::parse(head),
            path: rest.to_string(),
        }
    }

    /// The literal span this reference occupied in its template.
    pub fn marker(&self) -> String {
        format!("${{{}}}", self.raw)
    }
}

/// Extracts the reference expressions from a string value, in order.
///
/// Returned expressions do not include the `${` / `}` delimiters. A span
/// without a closing brace terminates the scan; the remainder is plain text.
pub fn extract_references(value: &str) -> Vec<VariableReference> {
    let mut references = Vec::new();
    let mut remainder = value;

    while let Some(start) = remainder.find("${") {
        let after_start = &remainder[start + 2..];
        let Some(end) = after_start.find('}') else {
            break;
        };
        let expression = after_start[..end].trim();
        if !expression.is_empty() {
            references.push(VariableReference::parse(expression));
        }
        remainder = &after_start[end + 1..];
    }

    references
}

/// Collects every reference in a JSON value tree, depth-first.
pub fn collect_references(value: &Value, references: &mut Vec<VariableReference>) {
    match value {
        Value::String(text) => references.extend(extract_references(text)),
        Value::Array(items) => {
            for item in items {
                collect_references(item, references);
            }
        }
        Value::Object(map) => {
            for nested in map.values() {
                collect_references(nested, references);
            }
        }
        _ => {}
    }
}

/// True when the string is exactly one reference span and nothing else.
pub fn is_single_reference(value: &str) -> bool {
    let trimmed = value.trim();
    if !trimmed.starts_with("${") || !trimmed.ends_with('}') {
        return false;
    }
    let inner = &trimmed[2..trimmed.len() - 1];
    !inner.contains("${") && !inner.contains('}')
}

/// Navigates a JSON value by a dot path with optional `[index]` segments.
///
/// Supports `a.b`, `items.0.id`, and `items[0].id`. Returns `None` when any
/// segment is missing or applied to the wrong JSON type.
pub fn navigate_value<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in split_segments(trimmed) {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn split_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(character) = chars.next() {
        match character {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut inner = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    inner.push(next);
                }
                if !inner.trim().is_empty() {
                    segments.push(inner.trim().to_string());
                }
            }
            _ => current.push(character),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Formats a JSON value the way it appears inside interpolated strings.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(boolean) => boolean.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
