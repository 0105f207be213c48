//! Helpers for state records and object documents.

use serde_json::{Map, Value};

/// Field a bare scalar is wrapped into when written as a state.
pub const STATE_VALUE_FIELD: &str = "value";

/// Normalize a state write.
///
/// A bare scalar (number, string or boolean) is wrapped as
/// `{"value": <input>}`. Objects, arrays and `null` are forwarded unchanged.
pub fn normalize_state(value: Value) -> Value {
    match value {
        Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            let mut record = Map::new();
            record.insert(STATE_VALUE_FIELD.to_string(), value);
            Value::Object(record)
        }
        other => other,
    }
}

/// Merge `patch` into `target`.
///
/// Objects are merged key by key, recursively. Any other patch value,
/// including `null` and arrays, replaces the target value outright.
pub fn merge_patch(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_patch(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_is_wrapped() {
        assert_eq!(normalize_state(json!(21)), json!({"value": 21}));
        assert_eq!(normalize_state(json!("on")), json!({"value": "on"}));
        assert_eq!(normalize_state(json!(false)), json!({"value": false}));
    }

    #[test]
    fn test_record_passes_through() {
        let record = json!({"value": 21, "ack": true});
        assert_eq!(normalize_state(record.clone()), record);
    }

    #[test]
    fn test_null_and_arrays_pass_through() {
        assert_eq!(normalize_state(Value::Null), Value::Null);
        assert_eq!(normalize_state(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_merge_patch_is_recursive() {
        let mut doc = json!({
            "type": "state",
            "common": {"name": "Temperature", "unit": "C"},
            "native": {}
        });
        merge_patch(
            &mut doc,
            json!({"common": {"name": "Outside temperature"}, "native": {"pin": 4}}),
        );
        assert_eq!(
            doc,
            json!({
                "type": "state",
                "common": {"name": "Outside temperature", "unit": "C"},
                "native": {"pin": 4}
            })
        );
    }

    #[test]
    fn test_merge_patch_replaces_non_objects() {
        let mut doc = json!({"common": {"states": [1, 2, 3]}});
        merge_patch(&mut doc, json!({"common": {"states": [4]}}));
        assert_eq!(doc, json!({"common": {"states": [4]}}));

        let mut scalar = json!(5);
        merge_patch(&mut scalar, json!({"a": 1}));
        assert_eq!(scalar, json!({"a": 1}));
    }
}
