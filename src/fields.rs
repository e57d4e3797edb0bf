// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # AMQP Field Conversion
//!
//! Conversions between the JSON option trees carried by the configuration and
//! the field tables the driver speaks, plus helpers for the nested header
//! block this crate stamps on forwarded and encrypted messages.

use lapin::types::{AMQPValue, FieldArray, FieldTable, ShortString};
use serde_json::Value;
use std::collections::BTreeMap;

/// Root header key for metadata stamped by this crate.
pub const HEADER_ROOT: &str = "rascal";
/// Sub-table describing the encryption envelope.
pub const HEADER_ENCRYPTION: &str = "encryption";
/// Sub-table carrying trace propagation fields.
pub const HEADER_TRACE: &str = "trace";
pub const HEADER_ENCRYPTION_IV: &str = "iv";
pub const HEADER_ENCRYPTION_NAME: &str = "name";
pub const HEADER_ORIGINAL_CONTENT_TYPE: &str = "originalContentType";
pub const HEADER_ORIGINAL_QUEUE: &str = "originalQueue";
pub const HEADER_ORIGINAL_EXCHANGE: &str = "originalExchange";
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "originalRoutingKey";
pub const HEADER_RESTORE_ROUTING_HEADERS: &str = "restoreRoutingHeaders";

/// Converts a JSON value into its closest AMQP field value.
pub(crate) fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(value) => AMQPValue::Boolean(*value),
        Value::Number(value) => {
            if let Some(value) = value.as_i64() {
                AMQPValue::LongLongInt(value)
            } else {
                AMQPValue::Double(value.as_f64().unwrap_or_default())
            }
        }
        Value::String(value) => AMQPValue::LongString(value.clone().into()),
        Value::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(
                values.iter().map(to_amqp_value).collect::<Vec<_>>(),
            ))
        }
        Value::Object(_) => AMQPValue::FieldTable(to_field_table(value)),
    }
}

/// Converts a JSON object into a field table. Non-objects yield an empty
/// table.
pub(crate) fn to_field_table(value: &Value) -> FieldTable {
    let mut table = BTreeMap::new();
    if let Some(object) = value.as_object() {
        for (key, value) in object {
            table.insert(ShortString::from(key.clone()), to_amqp_value(value));
        }
    }
    FieldTable::from(table)
}

/// Converts an AMQP field value back into JSON for application consumption.
pub(crate) fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(value) => Value::Bool(*value),
        AMQPValue::ShortShortInt(value) => Value::from(*value),
        AMQPValue::ShortShortUInt(value) => Value::from(*value),
        AMQPValue::ShortInt(value) => Value::from(*value),
        AMQPValue::ShortUInt(value) => Value::from(*value),
        AMQPValue::LongInt(value) => Value::from(*value),
        AMQPValue::LongUInt(value) => Value::from(*value),
        AMQPValue::LongLongInt(value) => Value::from(*value),
        AMQPValue::Float(value) => Value::from(*value),
        AMQPValue::Double(value) => Value::from(*value),
        AMQPValue::ShortString(value) => Value::String(value.to_string()),
        AMQPValue::LongString(value) => {
            Value::String(String::from_utf8_lossy(value.as_bytes()).to_string())
        }
        AMQPValue::FieldArray(values) => Value::Array(
            values.as_slice().iter().map(from_amqp_value).collect(),
        ),
        AMQPValue::FieldTable(table) => {
            let mut object = serde_json::Map::new();
            for (key, value) in table.inner() {
                object.insert(key.to_string(), from_amqp_value(value));
            }
            Value::Object(object)
        }
        _ => Value::Null,
    }
}

/// Reads a string from a nested header path, e.g.
/// `rascal` → `encryption` → `iv`.
pub(crate) fn nested_string(table: &FieldTable, path: &[&str]) -> Option<String> {
    let (last, parents) = path.split_last()?;
    let mut current = table.inner();
    for parent in parents {
        match current.get(&ShortString::from(*parent)) {
            Some(AMQPValue::FieldTable(nested)) => current = nested.inner(),
            _ => return None,
        }
    }
    match current.get(&ShortString::from(*last)) {
        Some(AMQPValue::LongString(value)) => {
            Some(String::from_utf8_lossy(value.as_bytes()).to_string())
        }
        Some(AMQPValue::ShortString(value)) => Some(value.to_string()),
        _ => None,
    }
}

/// Collects the string entries of a nested header table.
///
/// # Parameters
/// * `table` - The delivered header table
/// * `path` - Keys leading to the nested table, e.g. `rascal` → `trace`
///
/// # Returns
/// The `(key, value)` pairs of the table at `path`. Missing tables yield an
/// empty list; non-string values are skipped.
pub(crate) fn nested_entries(table: &FieldTable, path: &[&str]) -> Vec<(String, String)> {
    let mut current = table.inner();
    for parent in path {
        match current.get(&ShortString::from(*parent)) {
            Some(AMQPValue::FieldTable(nested)) => current = nested.inner(),
            _ => return Vec::new(),
        }
    }
    current
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => Some((
                key.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )),
            AMQPValue::ShortString(value) => Some((key.to_string(), value.to_string())),
            _ => None,
        })
        .collect()
}

/// Inserts a sub-table into a header map under [`HEADER_ROOT`], merging with
/// any block already present.
pub(crate) fn insert_nested(
    headers: &mut BTreeMap<ShortString, AMQPValue>,
    key: &str,
    entries: BTreeMap<ShortString, AMQPValue>,
) {
    let mut root = match headers.remove(&ShortString::from(HEADER_ROOT)) {
        Some(AMQPValue::FieldTable(table)) => table.inner().clone(),
        _ => BTreeMap::new(),
    };
    root.insert(
        ShortString::from(key),
        AMQPValue::FieldTable(FieldTable::from(entries)),
    );
    headers.insert(
        ShortString::from(HEADER_ROOT),
        AMQPValue::FieldTable(FieldTable::from(root)),
    );
}

/// Inserts plain values into the [`HEADER_ROOT`] block of a header map.
pub(crate) fn insert_root_values(
    headers: &mut BTreeMap<ShortString, AMQPValue>,
    entries: Vec<(&str, AMQPValue)>,
) {
    let mut root = match headers.remove(&ShortString::from(HEADER_ROOT)) {
        Some(AMQPValue::FieldTable(table)) => table.inner().clone(),
        _ => BTreeMap::new(),
    };
    for (key, value) in entries {
        root.insert(ShortString::from(key), value);
    }
    headers.insert(
        ShortString::from(HEADER_ROOT),
        AMQPValue::FieldTable(FieldTable::from(root)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_scalars_and_nested_objects() {
        let table = to_field_table(&json!({
            "durable": true,
            "arguments": { "x-max-length": 100 },
            "description": "a queue",
        }));
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("durable")),
            Some(&AMQPValue::Boolean(true))
        );
        match inner.get(&ShortString::from("arguments")) {
            Some(AMQPValue::FieldTable(arguments)) => {
                assert_eq!(
                    arguments.inner().get(&ShortString::from("x-max-length")),
                    Some(&AMQPValue::LongLongInt(100))
                );
            }
            other => panic!("expected nested table, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let original = json!({ "a": 1, "b": "two", "c": [true, false] });
        let round_tripped = from_amqp_value(&to_amqp_value(&original));
        assert_eq!(round_tripped, original);
    }

    #[test]
    fn reads_nested_strings() {
        let mut headers = BTreeMap::new();
        let mut entries = BTreeMap::new();
        entries.insert(
            ShortString::from(HEADER_ENCRYPTION_NAME),
            AMQPValue::LongString("profile".into()),
        );
        insert_nested(&mut headers, HEADER_ENCRYPTION, entries);
        let table = FieldTable::from(headers);
        assert_eq!(
            nested_string(&table, &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ENCRYPTION_NAME]),
            Some("profile".to_string())
        );
        assert_eq!(nested_string(&table, &[HEADER_ROOT, "missing"]), None);
    }

    #[test]
    fn collects_nested_entries() {
        let mut headers = BTreeMap::new();
        let mut entries = BTreeMap::new();
        entries.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString("00-abc-def-01".into()),
        );
        entries.insert(ShortString::from("hops"), AMQPValue::LongLongInt(3));
        insert_nested(&mut headers, HEADER_TRACE, entries);
        let table = FieldTable::from(headers);

        let collected = nested_entries(&table, &[HEADER_ROOT, HEADER_TRACE]);
        assert_eq!(
            collected,
            vec![("traceparent".to_string(), "00-abc-def-01".to_string())]
        );
        assert!(nested_entries(&table, &[HEADER_ROOT, "missing"]).is_empty());
    }
}
