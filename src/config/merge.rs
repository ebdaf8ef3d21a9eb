//! Field-by-field merging of configuration tiers.
//!
//! Objects merge recursively; every other value in a higher tier replaces the
//! lower one. A `null` in a higher tier means "not set here" and keeps the
//! lower value.

use serde_json::Value;

/// Merge `overlay` onto `base`.
///
/// ```
/// use serde_json::json;
/// use tasksync::config::deep_merge;
///
/// let base = json!({ "api": { "base_url": "http://localhost:8000", "request_timeout_ms": 10000 } });
/// let overlay = json!({ "api": { "request_timeout_ms": 2500 } });
/// let merged = deep_merge(base, overlay);
/// assert_eq!(merged["api"]["base_url"], "http://localhost:8000");
/// assert_eq!(merged["api"]["request_timeout_ms"], 2500);
/// ```
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(upper)) => {
            for (key, upper_value) in upper {
                let value = match merged.remove(&key) {
                    Some(lower_value) => deep_merge(lower_value, upper_value),
                    None => upper_value,
                };
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Merge tiers in order, lowest priority first.
pub fn deep_merge_all(tiers: impl IntoIterator<Item = Value>) -> Value {
    tiers.into_iter().fold(Value::Null, deep_merge)
}
