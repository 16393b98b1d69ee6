use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored or submitted record: field name → JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Result of count-style operations (bulk updates, counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResult {
    pub count: usize,
}

/// Generate a new random ID (UUIDv4, no dashes).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "")
}

/// Render an identifier value as a string key.
///
/// Strings (non-empty) and numbers are identifiers; anything else is not.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Merge a JSON patch into a record.
///
/// For each key in `patch`:
/// - If the value is `null`, the key is removed from `base`.
/// - If both sides are objects, they are merged recursively.
/// - Otherwise, the key is set to the patch value.
///
/// This follows RFC 7386 (JSON Merge Patch) semantics.
pub fn merge_patch(base: &mut Record, patch: &Record) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                base.remove(key);
            }
            Value::Object(nested) => {
                let entry = base
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Record::new()));
                match entry {
                    Value::Object(existing) => merge_patch(existing, nested),
                    other => *other = Value::Object(nested.clone()),
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
