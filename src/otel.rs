// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Trace Propagation
//!
//! Carries OpenTelemetry context across the broker inside this crate's own
//! `rascal.trace` header block, alongside the encryption and forwarding
//! metadata. The publication layer injects the current context before a
//! message goes out; the subscriber session extracts it again so its consumer
//! span joins the producer's trace.

use crate::fields::{insert_nested, nested_entries, HEADER_ROOT, HEADER_TRACE};
use lapin::types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::Context;
use std::collections::{BTreeMap, HashMap};

/// Staging area for outgoing propagation fields, flushed into the
/// `rascal.trace` block once the propagator has written them all.
#[derive(Default)]
struct TraceBlock {
    entries: BTreeMap<ShortString, AMQPValue>,
}

impl Injector for TraceBlock {
    /// Records one propagation field, e.g. `traceparent`.
    ///
    /// # Parameters
    /// * `key` - The propagation field name
    /// * `value` - The encoded field value
    fn set(&mut self, key: &str, value: String) {
        self.entries
            .insert(ShortString::from(key), AMQPValue::LongString(value.into()));
    }
}

/// Propagation fields recovered from a delivery. The fields are copied out of
/// the header tables so the extractor can hand out borrowed values.
struct TraceContext {
    entries: HashMap<String, String>,
}

impl TraceContext {
    /// Reads the `rascal.trace` block out of delivery properties.
    ///
    /// # Parameters
    /// * `properties` - Properties of the delivered message
    ///
    /// # Returns
    /// A TraceContext holding whatever fields the producer propagated, empty
    /// when the message carries no trace block
    fn from_properties(properties: &BasicProperties) -> TraceContext {
        let entries = properties
            .headers()
            .as_ref()
            .map(|headers| nested_entries(headers, &[HEADER_ROOT, HEADER_TRACE]))
            .unwrap_or_default()
            .into_iter()
            .collect();
        TraceContext { entries }
    }
}

impl Extractor for TraceContext {
    /// Gets one propagation field by name.
    ///
    /// # Parameters
    /// * `key` - The propagation field name
    ///
    /// # Returns
    /// The field value, or None if the producer did not send it
    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Gets the names of all propagated fields.
    ///
    /// # Returns
    /// A vector of field names as string slices
    fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Injects a context into an outgoing header map under the `rascal.trace`
/// block.
///
/// # Parameters
/// * `ctx` - The context to propagate
/// * `headers` - Headers of the outgoing message
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let mut block = TraceBlock::default();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut block)
    });
    if !block.entries.is_empty() {
        insert_nested(headers, HEADER_TRACE, block.entries);
    }
}

/// Recovers the upstream context from delivery properties.
///
/// # Parameters
/// * `properties` - Properties of the delivered message
///
/// # Returns
/// The propagated context, or the current default when the message carries no
/// trace block
pub(crate) fn extract_context(properties: &BasicProperties) -> Context {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&TraceContext::from_properties(properties))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldTable;

    #[test]
    fn trace_fields_round_trip_through_the_header_block() {
        let mut block = TraceBlock::default();
        block.set("traceparent", "00-abc-def-01".to_string());
        block.set("tracestate", "vendor=1".to_string());

        let mut headers = BTreeMap::new();
        insert_nested(&mut headers, HEADER_TRACE, block.entries);
        let properties = BasicProperties::default().with_headers(FieldTable::from(headers));

        let recovered = TraceContext::from_properties(&properties);
        assert_eq!(recovered.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(recovered.get("tracestate"), Some("vendor=1"));
        assert_eq!(recovered.get("baggage"), None);
        assert_eq!(recovered.keys().len(), 2);
    }

    #[test]
    fn messages_without_a_trace_block_yield_nothing() {
        let recovered = TraceContext::from_properties(&BasicProperties::default());
        assert!(recovered.keys().is_empty());
    }
}
