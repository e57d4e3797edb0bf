// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Redelivery Counters
//!
//! Counters track how many times a message has been redelivered so a
//! subscription can stop thrashing on a poison message. The counter is a
//! seam: the built-in `stub` and `inMemory` implementations ship here, and
//! callers may register their own factories (for example a clustered
//! counter) through the broker components.

use crate::config::CounterConfig;
use crate::errors::Error;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Tracks redeliveries keyed by message identity.
#[async_trait]
pub trait RedeliveryCounter: Send + Sync {
    /// Records one more redelivery of a message.
    ///
    /// # Parameters
    /// * `key` - The message identity, normally its message id
    ///
    /// # Returns
    /// The running redelivery count for the key, as this counter knows it
    async fn increment_and_get(&self, key: &str) -> u64;
}

/// Builds a counter from its resolved configuration.
pub type CounterFactory =
    Box<dyn Fn(&CounterConfig) -> Result<Arc<dyn RedeliveryCounter>, Error> + Send + Sync>;

/// A counter that never counts. Redelivery limits are effectively disabled.
#[derive(Debug, Default)]
pub struct StubCounter;

#[async_trait]
impl RedeliveryCounter for StubCounter {
    async fn increment_and_get(&self, _key: &str) -> u64 {
        0
    }
}

/// A bounded in-process counter. Entries are evicted in insertion order once
/// the size limit is reached, so a long running process cannot accumulate a
/// count per message it has ever seen.
pub struct InMemoryCounter {
    size: usize,
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    counts: HashMap<String, u64>,
    order: VecDeque<String>,
}

impl InMemoryCounter {
    pub fn new(size: usize) -> Self {
        InMemoryCounter {
            size: size.max(1),
            state: Mutex::new(InMemoryState::default()),
        }
    }
}

#[async_trait]
impl RedeliveryCounter for InMemoryCounter {
    async fn increment_and_get(&self, key: &str) -> u64 {
        let mut state = self.state.lock().expect("counter state");
        if let Some(count) = state.counts.get_mut(key) {
            *count += 1;
            return *count;
        }
        while state.order.len() >= self.size {
            if let Some(evicted) = state.order.pop_front() {
                state.counts.remove(&evicted);
            }
        }
        state.counts.insert(key.to_string(), 1);
        state.order.push_back(key.to_string());
        1
    }
}

/// The counter types this crate ships.
pub(crate) fn builtin_types() -> HashSet<String> {
    HashSet::from(["stub".to_string(), "inMemory".to_string()])
}

/// Builds every configured counter, preferring caller supplied factories
/// over the built-in implementations.
pub(crate) fn build_counters(
    counters: impl Iterator<Item = (String, CounterConfig)>,
    factories: &HashMap<String, CounterFactory>,
) -> Result<BTreeMap<String, Arc<dyn RedeliveryCounter>>, Error> {
    let mut built: BTreeMap<String, Arc<dyn RedeliveryCounter>> = BTreeMap::new();
    for (name, config) in counters {
        let kind = config.kind().to_string();
        let counter = if let Some(factory) = factories.get(&kind) {
            factory(&config)?
        } else {
            match kind.as_str() {
                "stub" => Arc::new(StubCounter) as Arc<dyn RedeliveryCounter>,
                "inMemory" => {
                    let size = config
                        .options
                        .get("size")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(1000) as usize;
                    Arc::new(InMemoryCounter::new(size)) as Arc<dyn RedeliveryCounter>
                }
                other => {
                    return Err(Error::Configuration(format!(
                        "Counter: {name} has an unknown type: {other}"
                    )))
                }
            }
        };
        built.insert(name, counter);
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_counter_never_counts() {
        let counter = StubCounter;
        assert_eq!(counter.increment_and_get("m1").await, 0);
        assert_eq!(counter.increment_and_get("m1").await, 0);
    }

    #[tokio::test]
    async fn in_memory_counter_counts_per_key() {
        let counter = InMemoryCounter::new(10);
        assert_eq!(counter.increment_and_get("m1").await, 1);
        assert_eq!(counter.increment_and_get("m1").await, 2);
        assert_eq!(counter.increment_and_get("m2").await, 1);
    }

    #[tokio::test]
    async fn in_memory_counter_evicts_in_insertion_order() {
        let counter = InMemoryCounter::new(2);
        counter.increment_and_get("m1").await;
        counter.increment_and_get("m2").await;
        counter.increment_and_get("m3").await;
        // m1 was evicted, so its count starts over
        assert_eq!(counter.increment_and_get("m1").await, 1);
    }

    #[test]
    fn custom_factories_win_over_builtins() {
        let mut factories: HashMap<String, CounterFactory> = HashMap::new();
        factories.insert(
            "stub".to_string(),
            Box::new(|_| Ok(Arc::new(InMemoryCounter::new(1)) as Arc<dyn RedeliveryCounter>)),
        );
        let config = CounterConfig {
            name: "stub".to_string(),
            kind: Some("stub".to_string()),
            ..Default::default()
        };
        let built =
            build_counters(vec![("stub".to_string(), config)].into_iter(), &factories).unwrap();
        assert!(built.contains_key("stub"));
    }
}
