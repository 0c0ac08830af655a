//! PII redaction for log output.
//!
//! Anything a caller says or the carrier reports about a caller passes through
//! here before it reaches a log line.

use regex::Regex;
use serde_json::Value;
use std::{borrow::Cow, sync::LazyLock};

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\+?1[\s.-]?)?\(?[2-9]\d{2}\)?[\s.-]?\d{3}[\s.-]?\d{4}").expect("valid regex")
});
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid regex")
});
static CREDIT_CARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").expect("valid regex")
});
static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid regex"));
static CARRIER_SID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(AC|CA|SM|PN|RE|MG|MZ)[a-f0-9]{32}\b").expect("valid regex")
});

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "apikey",
    "api_key",
    "token",
    "secret",
    "authorization",
];

/// Masks phone numbers, e-mail addresses, card numbers and SSNs, and shortens
/// carrier SIDs to their first and last four characters.
pub fn redact_text(text: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(text);
    // Cards and SSNs first, so the phone pattern does not eat their digits.
    for (pattern, replacement) in [
        (&*CREDIT_CARD, "[CC_REDACTED]"),
        (&*SSN, "[SSN_REDACTED]"),
        (&*EMAIL, "[EMAIL_REDACTED]"),
    ] {
        if pattern.is_match(&out) {
            out = Cow::Owned(pattern.replace_all(&out, replacement).into_owned());
        }
    }
    if CARRIER_SID.is_match(&out) {
        out = Cow::Owned(
            CARRIER_SID
                .replace_all(&out, |caps: &regex::Captures| shorten(&caps[0]))
                .into_owned(),
        );
    }
    if PHONE.is_match(&out) {
        out = Cow::Owned(PHONE.replace_all(&out, "[PHONE_REDACTED]").into_owned());
    }
    out
}

/// Recursively redacts a JSON value. Values under sensitive keys are replaced
/// wholesale; every other string goes through [`redact_text`].
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_text(s).into_owned()),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let redacted = if is_sensitive_key(key) {
                        Value::String("[REDACTED]".to_string())
                    } else {
                        redact_value(v)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Keeps `show` characters at each end and stars out the middle.
pub fn partial_redact(value: &str, show: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= show * 2 {
        return "[REDACTED]".to_string();
    }
    let prefix: String = chars[..show].iter().collect();
    let suffix: String = chars[chars.len() - show..].iter().collect();
    format!("{prefix}{}{suffix}", "*".repeat(chars.len() - show * 2))
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|k| key.contains(k))
}

fn shorten(sid: &str) -> String {
    format!("{}...{}", &sid[..4], &sid[sid.len() - 4..])
}
