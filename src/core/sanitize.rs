//! Secret redaction for captured loop output.

use std::sync::LazyLock;

use regex::Regex;

/// Replacement text for redacted secrets.
pub const REDACTED: &str = "[REDACTED]";

static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"sk-[a-zA-Z0-9]{20,}",
        r"key-[a-zA-Z0-9]{20,}",
        r#"api[_-]?key[=:]\s*['"]?[a-zA-Z0-9_-]+['"]?"#,
        r"ANTHROPIC_API_KEY=[^\s]+",
        r"OPENAI_API_KEY=[^\s]+",
        r#"(password|secret|token)[=:]\s*['"]?[^\s'"]+['"]?"#,
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts API keys and credential assignments from a line of output.
#[must_use]
pub fn sanitize_log(content: &str) -> String {
    let mut result = content.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        if pattern.is_match(&result) {
            result = pattern.replace_all(&result, REDACTED).into_owned();
        }
    }
    result
}
