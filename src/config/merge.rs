// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Configuration Merging
//!
//! Deep merge of JSON configuration trees. The overlay wins over the base,
//! objects are merged recursively, and arrays and scalars replace the base
//! value wholesale. A `null` in the overlay is treated as absent so that
//! unset optional fields never clobber a default.

use serde_json::Value;

/// Merges `overlay` on top of `base` and returns the combined tree.
///
/// Merge rules:
/// - objects are merged key by key, recursively
/// - arrays, strings, numbers and booleans in the overlay replace the base
/// - `null` overlay values leave the base value in place
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                if !merged.is_null() {
                    base.insert(key, merged);
                }
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_wins_over_base() {
        let merged = deep_merge(json!({ "a": 1, "b": 2 }), json!({ "b": 3 }));
        assert_eq!(merged, json!({ "a": 1, "b": 3 }));
    }

    #[test]
    fn objects_merge_recursively() {
        let merged = deep_merge(
            json!({ "options": { "durable": true, "arguments": { "x": 1 } } }),
            json!({ "options": { "arguments": { "y": 2 } } }),
        );
        assert_eq!(
            merged,
            json!({ "options": { "durable": true, "arguments": { "x": 1, "y": 2 } } })
        );
    }

    #[test]
    fn arrays_replace_rather_than_concatenate() {
        let merged = deep_merge(json!({ "hosts": ["a", "b"] }), json!({ "hosts": ["c"] }));
        assert_eq!(merged, json!({ "hosts": ["c"] }));
    }

    #[test]
    fn null_overlay_preserves_base() {
        let merged = deep_merge(json!({ "a": 1 }), json!({ "a": null, "b": null }));
        assert_eq!(merged, json!({ "a": 1 }));
    }

    #[test]
    fn scalar_overlay_replaces_object() {
        let merged = deep_merge(json!({ "a": { "b": 1 } }), json!({ "a": 2 }));
        assert_eq!(merged, json!({ "a": 2 }));
    }
}
