//! Redaction helpers for credentials and sensitive request data.
//!
//! Everything persisted by the store goes through these functions first:
//! API keys, header values, and query strings are masked irreversibly
//! before they reach SQLite.

/// Header names (substring match, case-insensitive) whose values are masked
/// before persistence.
const SENSITIVE_HEADER_PATTERNS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api-key",
    "x-goog-api-key",
    "cookie",
    "set-cookie",
    "x-management-key",
];

/// Query parameter names (substring match, case-insensitive) whose values
/// are masked when the request URL is persisted.
const SENSITIVE_QUERY_PATTERNS: &[&str] = &["key", "token", "secret", "password", "auth"];

/// Mask an API key for display, showing only the first and last 2 characters.
/// Keys of 4 characters or fewer are fully starred.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
}

/// Mask a sensitive header or query value, keeping only a short prefix and
/// suffix. Values of 8 characters or fewer are fully starred.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Returns true for header names whose values must not be stored verbatim.
pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADER_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Mask the values of credential-bearing parameters in a raw query string,
/// preserving parameter order. Returns the input unchanged when nothing
/// matches; empty input yields an empty string.
pub fn mask_sensitive_query(raw_query: &str) -> String {
    if raw_query.is_empty() {
        return String::new();
    }

    raw_query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if is_sensitive_query_param(name) => {
                format!("{}={}", name, mask_value(value))
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn is_sensitive_query_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_QUERY_PATTERNS.iter().any(|p| lower.contains(p))
}
