//! Sensitive field scrubbing shared by the logger and the crash reporter.

use serde_json::{Map, Value};
use url::form_urlencoded;

/// Replacement value for anything that must not leave the process.
pub const REDACTED: &str = "[REDACTED]";

/// Context keys whose values are always replaced with [`REDACTED`].
pub const SENSITIVE_FIELDS: [&str; 10] = [
    "password",
    "token",
    "accessToken",
    "refreshToken",
    "secret",
    "apiKey",
    "authorization",
    "cookie",
    "creditCard",
    "ssn",
];

/// Request headers dropped from crash reports.
pub const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "cookie", "x-api-key"];

/// Whether `key` names a sensitive field.
///
/// Matching ignores ASCII case, `_` and `-`, so `access_token`, `Access-Token`
/// and `accessToken` are the same field.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect();

    SENSITIVE_FIELDS
        .iter()
        .any(|field| field.eq_ignore_ascii_case(&normalized))
}

pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
        || is_sensitive_key(name)
}

/// Redact sensitive keys at the top level and one level of nesting.
pub fn redact_map(map: &mut Map<String, Value>) {
    for (key, value) in map.iter_mut() {
        if is_sensitive_key(key) {
            *value = Value::String(REDACTED.to_string());
            continue;
        }

        if let Value::Object(nested) = value {
            for (nested_key, nested_value) in nested.iter_mut() {
                if is_sensitive_key(nested_key) {
                    *nested_value = Value::String(REDACTED.to_string());
                }
            }
        }
    }
}

/// Redact a JSON value in place when it is an object; other values pass through.
pub fn redact_value(value: &mut Value) {
    if let Value::Object(map) = value {
        redact_map(map);
    }
}

/// Parse a raw query string into a map. Repeated keys collect into an array.
pub fn parse_query(query: &str) -> Map<String, Value> {
    let mut map = Map::new();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.into_owned(), value);
            }
        }
    }

    map
}

/// Re-encode a query string with sensitive parameter values replaced.
pub fn redact_query(query: &str) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if is_sensitive_key(&key) {
            serializer.append_pair(&key, REDACTED);
        } else {
            serializer.append_pair(&key, &value);
        }
    }

    serializer.finish()
}
