//! HTTP path template helpers.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;

/// Every byte outside RFC3986 unreserved (`A-Z a-z 0-9 - . _ ~`) is
/// percent-encoded when substituted into a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Substitutes `{key}` placeholders in a path template with encoded values.
///
/// Placeholders without a matching variable are left unchanged so the
/// caller's template diagnostics can point at them.
///
/// ```
/// use serde_json::{Map, Value};
///
/// let mut variables = Map::new();
/// variables.insert("channel".into(), Value::String("team ops".into()));
/// let path = conduit_util::build_path("/channels/{channel}/messages", &variables);
/// assert_eq!(path, "/channels/team%20ops/messages");
/// ```
pub fn build_path(template: &str, variables: &serde_json::Map<String, Value>) -> String {
    let mut path = template.to_string();
    for (key, value) in variables.iter() {
        let raw = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let encoded = utf8_percent_encode(&raw, PATH_SEGMENT).to_string();
        path = path.replace(&format!("{{{key}}}"), &encoded);
    }
    path
}
