//! Redaction engine applied to every log record before it leaves the process
//!
//! Substitution is a fixed, ordered list of patterns applied left to right on
//! the same string, so a later pattern sees text already rewritten by an
//! earlier one. The order below is part of the contract:
//!
//! | # | Pattern        | Replacement            |
//! |---|----------------|------------------------|
//! | 1 | email          | `***@domain`           |
//! | 2 | phone          | `[PHONE_REDACTED]`     |
//! | 3 | jwt            | `[JWT_REDACTED]`       |
//! | 4 | api_key        | `key=[REDACTED]`       |
//! | 5 | password       | `password=[REDACTED]`  |
//! | 6 | credit_card    | `[CARD_REDACTED]`      |
//! | 7 | iban           | `[IBAN_REDACTED]`      |
//! | 8 | ipv4           | `[IP_REDACTED]`        |
//!
//! Map keys listed in [`SENSITIVE_KEYS`] are replaced wholesale with
//! [`SENSITIVE_KEY_MASK`] whatever their value, which covers short random
//! tokens no pattern would recognise.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Mask written in place of any value stored under a sensitive key
pub const SENSITIVE_KEY_MASK: &str = "***REDACTED***";

/// Map keys whose values are always masked (exact, case-sensitive match)
pub const SENSITIVE_KEYS: &[&str] = &["password", "token", "apiKey", "secret", "creditCard"];

/// One redaction rule
#[derive(Debug)]
pub struct SensitivePattern {
    /// Rule name
    pub name: &'static str,

    /// Compiled matcher
    pub matcher: Regex,

    /// Replacement template (may reference capture groups)
    pub replacement: &'static str,
}

impl SensitivePattern {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Self {
        Self {
            name,
            matcher: Regex::new(pattern).expect("static redaction pattern must compile"),
            replacement,
        }
    }
}

static PATTERNS: Lazy<Vec<SensitivePattern>> = Lazy::new(|| {
    vec![
        SensitivePattern::new(
            "email",
            r"\b[A-Za-z0-9._%+-]+@(?P<domain>[A-Za-z0-9.-]+\.[A-Za-z]{2,})\b",
            "***@${domain}",
        ),
        SensitivePattern::new(
            "phone",
            r"(?:\+\d{1,3}(?:[\s.-]?\d{2,4}){2,5})|(?:\b\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b)",
            "[PHONE_REDACTED]",
        ),
        SensitivePattern::new(
            "jwt",
            r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
            "[JWT_REDACTED]",
        ),
        SensitivePattern::new(
            "api_key",
            r#"(?i)\b(?P<key>(?:api[_-]?key|access[_-]?token|auth[_-]?token|refresh[_-]?token|client[_-]?secret|token|secret)["']?\s*[:=]\s*|bearer\s+)["']?[^\s,;"'&]+["']?"#,
            "${key}[REDACTED]",
        ),
        SensitivePattern::new(
            "password",
            r#"(?i)\b(?P<key>(?:password|passwd|pwd|pass)["']?\s*[:=]\s*)["']?[^\s,;"'&]+["']?"#,
            "${key}[REDACTED]",
        ),
        SensitivePattern::new(
            "credit_card",
            r"\b(?:\d[ .-]?){12,18}\d\b",
            "[CARD_REDACTED]",
        ),
        SensitivePattern::new(
            "iban",
            r"\b[A-Z]{2}\d{2}(?:\s?[A-Z0-9]{4}){2,7}(?:\s?[A-Z0-9]{1,3})?\b",
            "[IBAN_REDACTED]",
        ),
        SensitivePattern::new(
            "ipv4",
            r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
            "[IP_REDACTED]",
        ),
    ]
});

/// The ordered pattern list
pub fn sensitive_patterns() -> &'static [SensitivePattern] {
    &PATTERNS
}

/// Redact a single string
pub fn redact_str(input: &str) -> String {
    let mut output = input.to_string();
    for pattern in PATTERNS.iter() {
        if pattern.matcher.is_match(&output) {
            output = pattern
                .matcher
                .replace_all(&output, pattern.replacement)
                .into_owned();
        }
    }
    output
}

/// Redact any JSON value, recursing into arrays and objects
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_str(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(redact_map(map)),
        other => other.clone(),
    }
}

/// Redact a key/value map, masking sensitive keys wholesale
pub fn redact_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let redacted = if is_sensitive_key(key) {
                Value::String(SENSITIVE_KEY_MASK.to_string())
            } else {
                redact_value(value)
            };
            (key.clone(), redacted)
        })
        .collect()
}

/// Whether a map key is always masked
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.contains(&key)
}
