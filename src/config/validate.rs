// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Configuration Validation
//!
//! Semantic rules that cannot be expressed as merges: referential integrity
//! between publications, subscriptions, shovels and the topology they name,
//! counter types, and connection URL sanity. Validation is pure; every
//! violation is collected and the set is surfaced as a single error value.

use super::schema::{BrokerConfig, VhostConfig};
use crate::errors::Error;
use std::collections::HashSet;
use url::Url;

const ACCEPTED_PROTOCOLS: [&str; 2] = ["amqp", "amqps"];

/// Validates a resolved configuration against the built-in counter types.
///
/// # Parameters
/// * `config` - A configuration previously expanded by `configure`
///
/// # Returns
/// * `Result<(), Error>` - Ok when every rule holds, or a single validation
///   error listing every violation by entity name
pub fn validate(config: &BrokerConfig) -> Result<(), Error> {
    validate_with(config, &crate::counter::builtin_types())
}

/// Validates a resolved configuration against the given counter registry.
///
/// # Parameters
/// * `config` - A configuration previously expanded by `configure`
/// * `counter_types` - The counter types the registry can build, built-in
///   plus caller supplied
///
/// # Returns
/// * `Result<(), Error>` - Ok when every rule holds, or a single validation
///   error listing every violation by entity name
pub fn validate_with(config: &BrokerConfig, counter_types: &HashSet<String>) -> Result<(), Error> {
    let mut violations = Vec::new();

    for (name, vhost) in &config.vhosts {
        validate_connections(name, vhost, &mut violations);
    }
    validate_publications(config, &mut violations);
    validate_subscriptions(config, &mut violations);
    validate_shovels(config, &mut violations);
    validate_counters(config, counter_types, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(violations.join(", ")))
    }
}

fn validate_connections(name: &str, vhost: &VhostConfig, violations: &mut Vec<String>) {
    for spec in &vhost.connections {
        let Some(connection) = spec.as_config() else {
            continue;
        };
        let Some(url) = connection.url.as_deref() else {
            continue;
        };
        match Url::parse(url) {
            Ok(parsed) if ACCEPTED_PROTOCOLS.contains(&parsed.scheme()) => {}
            Ok(parsed) => violations.push(format!(
                "Vhost: {name} connection uses an unsupported protocol: {}",
                parsed.scheme()
            )),
            Err(_) => violations.push(format!(
                "Vhost: {name} has an invalid connection URL: {}",
                connection.loggable_url.as_deref().unwrap_or(url)
            )),
        }
    }
}

fn validate_publications(config: &BrokerConfig, violations: &mut Vec<String>) {
    for (name, publication) in &config.publications {
        match (&publication.exchange, &publication.queue) {
            (Some(_), Some(_)) => {
                violations.push(format!("Publication: {name} has both an exchange and a queue"));
                continue;
            }
            (None, None) => {
                violations.push(format!(
                    "Publication: {name} has neither an exchange nor a queue"
                ));
                continue;
            }
            _ => {}
        }

        let vhost_name = publication.vhost.as_deref().unwrap_or("/");
        let Some(vhost) = config.vhosts.get(vhost_name) else {
            violations.push(format!(
                "Publication: {name} refers to an unknown vhost: {vhost_name}"
            ));
            continue;
        };
        if let Some(exchange) = &publication.exchange {
            if vhost.exchange(exchange).is_none() {
                violations.push(format!(
                    "Publication: {name} refers to an unknown exchange: {exchange} in vhost: {vhost_name}"
                ));
            }
        }
        if let Some(queue) = &publication.queue {
            if vhost.queue(queue).is_none() {
                violations.push(format!(
                    "Publication: {name} refers to an unknown queue: {queue} in vhost: {vhost_name}"
                ));
            }
        }
    }
}

fn validate_subscriptions(config: &BrokerConfig, violations: &mut Vec<String>) {
    for (name, subscription) in &config.subscriptions {
        let Some(queue) = &subscription.queue else {
            violations.push(format!("Subscription: {name} has no queue"));
            continue;
        };
        let vhost_name = subscription.vhost.as_deref().unwrap_or("/");
        let Some(vhost) = config.vhosts.get(vhost_name) else {
            violations.push(format!(
                "Subscription: {name} refers to an unknown vhost: {vhost_name}"
            ));
            continue;
        };
        if vhost.queue(queue).is_none() {
            violations.push(format!(
                "Subscription: {name} refers to an unknown queue: {queue} in vhost: {vhost_name}"
            ));
        }
    }
}

fn validate_shovels(config: &BrokerConfig, violations: &mut Vec<String>) {
    for (name, shovel) in config.shovels.iter() {
        match &shovel.subscription {
            Some(subscription) if config.subscriptions.contains_key(subscription) => {}
            Some(subscription) => violations.push(format!(
                "Shovel: {name} refers to an unknown subscription: {subscription}"
            )),
            None => violations.push(format!("Shovel: {name} has no subscription")),
        }
        match &shovel.publication {
            Some(publication) if config.publications.contains_key(publication) => {}
            Some(publication) => violations.push(format!(
                "Shovel: {name} refers to an unknown publication: {publication}"
            )),
            None => violations.push(format!("Shovel: {name} has no publication")),
        }
    }
}

fn validate_counters(
    config: &BrokerConfig,
    counter_types: &HashSet<String>,
    violations: &mut Vec<String>,
) {
    for (name, counter) in config.redeliveries.counters.iter() {
        let kind = counter.kind();
        if !counter_types.contains(kind) {
            violations.push(format!("Counter: {name} has an unknown type: {kind}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::configure;
    use super::*;
    use serde_json::json;

    fn configured(value: serde_json::Value) -> BrokerConfig {
        configure(value).expect("configuration")
    }

    #[test]
    fn accepts_a_minimal_topology() {
        let config = configured(json!({
            "vhosts": { "/": { "exchanges": { "e1": {} }, "queues": { "q1": {} } } },
        }));
        validate(&config).expect("valid");
    }

    #[test]
    fn rejects_publications_with_unknown_vhosts() {
        let config = configured(json!({
            "publications": { "p1": { "vhost": "v1", "exchange": "e1" } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Publication: p1 refers to an unknown vhost: v1"));
    }

    #[test]
    fn rejects_publications_with_unknown_exchanges() {
        let config = configured(json!({
            "vhosts": { "/": {} },
            "publications": { "p1": { "exchange": "e9" } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Publication: p1 refers to an unknown exchange: e9 in vhost: /"));
    }

    #[test]
    fn rejects_publications_with_both_exchange_and_queue() {
        let config = configured(json!({
            "vhosts": { "/": { "exchanges": { "e1": {} }, "queues": { "q1": {} } } },
            "publications": { "p1": { "exchange": "e1", "queue": "q1" } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Publication: p1 has both an exchange and a queue"));
    }

    #[test]
    fn rejects_subscriptions_with_unknown_queues() {
        let config = configured(json!({
            "vhosts": { "/": {} },
            "subscriptions": { "s1": { "queue": "q9" } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Subscription: s1 refers to an unknown queue: q9 in vhost: /"));
    }

    #[test]
    fn rejects_shovels_with_unknown_endpoints() {
        let config = configured(json!({
            "vhosts": { "/": { "queues": { "q1": {} } } },
            "shovels": { "x1": { "subscription": "s9", "publication": "/q1" } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Shovel: x1 refers to an unknown subscription: s9"));
    }

    #[test]
    fn accepts_shovels_with_known_endpoints() {
        let config = configured(json!({
            "vhosts": { "/": { "queues": { "q1": {} }, "exchanges": { "e1": {} } } },
            "shovels": { "x1": { "subscription": "/q1", "publication": "/e1" } },
        }));
        validate(&config).expect("valid");
    }

    #[test]
    fn rejects_unknown_counter_types() {
        let config = configured(json!({
            "redeliveries": { "counters": { "weird": {} } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Counter: weird has an unknown type: weird"));
    }

    #[test]
    fn rejects_unsupported_connection_protocols() {
        let config = configured(json!({
            "vhosts": { "v1": { "connection": { "protocol": "http" } } },
        }));
        let err = validate(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("Vhost: v1 connection uses an unsupported protocol: http"));
    }
}
