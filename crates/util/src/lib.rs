use once_cell::sync::Lazy;
use regex::Regex;

pub mod backoff;
pub mod path;

pub use backoff::backoff_delay;
pub use path::build_path;

/// Marker substituted for sensitive resolved values and scrubbed secrets.
pub const REDACTION_MARKER: &str = "<redacted>";

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization: )(?:bearer |basic )?([\w\-\.=:/+]+)",
        r"(?i)([A-Z0-9_]*(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(?i)(bearer )([\w\-\.=/+]+)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("secret pattern compiles"))
    .collect()
});

/// Redacts values that look like secrets in a string.
///
/// Applied to upstream error text and log lines before they leave the
/// engine; structured secret handling (credentials, sensitive variables)
/// happens at the type level and never reaches this function.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}{REDACTION_MARKER}")
            })
            .to_string();
    }
    redacted
}

/// Initializes the global tracing subscriber from `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_authorization_headers() {
        let input = "request failed: Authorization: Bearer abc123.def";
        let redacted = redact_sensitive(input);
        assert!(!redacted.contains("abc123"), "got: {redacted}");
    }

    #[test]
    fn redacts_env_style_secrets() {
        let input = "SLACK_API_TOKEN=xoxb-1234 caused a 401";
        let redacted = redact_sensitive(input);
        assert!(!redacted.contains("xoxb-1234"));
        assert!(redacted.contains("SLACK_API_TOKEN=<redacted>"));
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        let input = "connection refused while calling /v1/users";
        assert_eq!(redact_sensitive(input), input);
    }
}
