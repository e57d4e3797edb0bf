// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Configuration Expansion
//!
//! The configurator: merges the user tree on top of the baseline and expands
//! it into the fully resolved topology. Expansion is synchronous, never
//! touches the network, and reports any structural contradiction as a
//! configuration error. Running the configurator over its own output is a
//! fixed point.

use super::baseline;
use super::connections::configure_connections;
use super::merge::deep_merge;
use super::schema::{
    apply_defaults, BindingConfig, BrokerConfig, CounterConfig, EntrySet, ExchangeConfig, Named,
    Namespace, PublicationConfig, QueueConfig, ReplyTo, SeqEntry, SubscriptionConfig,
    SubscriptionEncryption, VhostConfig,
};
use super::{qualify, EncryptionSpec};
use crate::errors::Error;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Expands a user configuration into the fully resolved form.
///
/// The output satisfies the invariants the validator and the runtime rely
/// on: every keyed entity carries its own name, every exchange and queue
/// carries its fully qualified name, bindings are fanned out one per key,
/// vhost-local publications and subscriptions are promoted to the root
/// collections, and every exchange and queue has a default publication and
/// subscription unless the user named one themselves.
///
/// # Parameters
/// * `user` - The user configuration as a JSON-shaped tree
///
/// # Returns
/// * `Result<BrokerConfig, Error>` - The resolved configuration, or a
///   configuration error describing the structural contradiction
pub fn configure(user: Value) -> Result<BrokerConfig, Error> {
    let merged = deep_merge(baseline::baseline(), user);
    let mut config: BrokerConfig =
        serde_json::from_value(merged).map_err(|err| Error::Configuration(err.to_string()))?;

    name_encryption_profiles(&mut config);
    configure_vhosts(&mut config)?;
    add_default_publications(&mut config);
    add_default_subscriptions(&mut config);
    configure_publications(&mut config)?;
    configure_subscriptions(&mut config)?;
    configure_shovels(&mut config)?;
    configure_counters(&mut config)?;
    Ok(config)
}

fn name_encryption_profiles(config: &mut BrokerConfig) {
    for (name, profile) in config.encryption.iter_mut() {
        profile.name = Some(name.clone());
    }
}

fn configure_vhosts(config: &mut BrokerConfig) -> Result<(), Error> {
    let defaults = config.defaults.get("vhosts").cloned().unwrap_or(Value::Null);
    let names: Vec<String> = config.vhosts.keys().cloned().collect();
    for name in names {
        let Some(mut vhost) = config.vhosts.remove(&name) else {
            continue;
        };
        configure_vhost(&mut vhost, &name, &defaults)?;
        promote_publications(config, &mut vhost)?;
        promote_subscriptions(config, &mut vhost)?;
        config.vhosts.insert(name, vhost);
    }
    Ok(())
}

fn configure_vhost(vhost: &mut VhostConfig, name: &str, defaults: &Value) -> Result<(), Error> {
    debug!("configuring vhost: {}", name);
    vhost.name = name.to_string();
    vhost.defaults = defaults.clone();

    if vhost.concurrency.is_none() {
        vhost.concurrency = defaults
            .get("concurrency")
            .and_then(Value::as_u64)
            .map(|concurrency| concurrency as u16);
    }
    if vhost.connection_strategy.is_none() {
        vhost.connection_strategy = defaults
            .get("connectionStrategy")
            .cloned()
            .and_then(|strategy| serde_json::from_value(strategy).ok());
    }
    let pools = vhost.publication_channel_pools.clone().unwrap_or_default();
    let pool_defaults = defaults
        .get("publicationChannelPools")
        .cloned()
        .unwrap_or(Value::Null);
    vhost.publication_channel_pools = Some(apply_defaults(&pools, &pool_defaults)?);

    vhost.namespace = match vhost.namespace.take() {
        Some(Namespace::Generated(true)) => Some(Namespace::Name(Uuid::new_v4().to_string())),
        Some(Namespace::Generated(false)) => None,
        other => other,
    };
    let namespace = vhost.namespace().map(str::to_string);

    configure_connections(vhost, defaults)?;
    configure_exchanges(vhost, namespace.as_deref(), defaults)?;
    configure_queues(vhost, namespace.as_deref(), defaults)?;
    configure_bindings(vhost, namespace.as_deref(), defaults)?;
    Ok(())
}

fn configure_exchanges(
    vhost: &mut VhostConfig,
    namespace: Option<&str>,
    defaults: &Value,
) -> Result<(), Error> {
    let exchange_defaults = defaults.get("exchanges").cloned().unwrap_or(Value::Null);
    let mut exchanges = normalize(&vhost.exchanges);
    exchanges
        .entry(String::new())
        .or_insert_with(ExchangeConfig::default);

    let mut resolved = BTreeMap::new();
    for (name, mut exchange) in exchanges {
        exchange.name = name.clone();
        let mut exchange: ExchangeConfig = apply_defaults(&exchange, &exchange_defaults)?;
        exchange.fully_qualified_name = Some(qualify(&name, namespace, None));
        resolved.insert(name, exchange);
    }
    vhost.exchanges = EntrySet::Map(resolved);
    Ok(())
}

fn configure_queues(
    vhost: &mut VhostConfig,
    namespace: Option<&str>,
    defaults: &Value,
) -> Result<(), Error> {
    let queue_defaults = defaults.get("queues").cloned().unwrap_or(Value::Null);
    let mut resolved = BTreeMap::new();
    for (name, mut queue) in normalize(&vhost.queues) {
        queue.name = name.clone();
        queue.reply_to = match queue.reply_to.take() {
            Some(ReplyTo::Generated(true)) => Some(ReplyTo::Tag(Uuid::new_v4().to_string())),
            Some(ReplyTo::Generated(false)) => None,
            other => other,
        };
        let mut queue: QueueConfig = apply_defaults(&queue, &queue_defaults)?;
        qualify_dead_letter_exchange(&mut queue, namespace);
        queue.fully_qualified_name = Some(qualify(&name, namespace, queue.reply_to_tag()));
        resolved.insert(name, queue);
    }
    vhost.queues = EntrySet::Map(resolved);
    Ok(())
}

/// Qualifies the `x-dead-letter-exchange` argument in place. The nameless
/// default exchange and already-qualified names are left alone.
fn qualify_dead_letter_exchange(queue: &mut QueueConfig, namespace: Option<&str>) {
    let Some(arguments) = queue
        .options
        .get_mut("arguments")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    if let Some(Value::String(exchange)) = arguments.get_mut("x-dead-letter-exchange") {
        *exchange = qualify_once(exchange, namespace);
    }
}

/// Qualifies a name unless it is empty or already carries the namespace
/// prefix, keeping reconfiguration a fixed point.
fn qualify_once(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(namespace)
            if !namespace.is_empty()
                && !name.is_empty()
                && !name.starts_with(&format!("{namespace}:")) =>
        {
            format!("{namespace}:{name}")
        }
        _ => name.to_string(),
    }
}

fn configure_bindings(
    vhost: &mut VhostConfig,
    namespace: Option<&str>,
    defaults: &Value,
) -> Result<(), Error> {
    let binding_defaults = defaults.get("bindings").cloned().unwrap_or(Value::Null);
    let mut resolved = BTreeMap::new();
    for (name, mut binding) in normalize(&vhost.bindings) {
        binding.name = name;
        for binding in expand_binding(binding) {
            let mut binding: BindingConfig = apply_defaults(&binding, &binding_defaults)?;
            if binding.qualify_binding_keys.unwrap_or(false) {
                if let Some(key) = binding.binding_key.take() {
                    binding.binding_key = Some(qualify_once(&key, namespace));
                }
            }
            resolved.insert(binding.name.clone(), binding);
        }
    }
    vhost.bindings = EntrySet::Map(resolved);
    Ok(())
}

/// Derives source, destination and binding keys from a patterned binding
/// name, then fans out one binding per key when more than one is present.
/// A binding whose routing fields are all explicit is taken as-is.
fn expand_binding(mut binding: BindingConfig) -> Vec<BindingConfig> {
    let fully_explicit = binding.source.is_some()
        && binding.destination.is_some()
        && binding.binding_key.is_some()
        && binding.binding_keys.is_none();

    let mut keys: Vec<String> = Vec::new();
    if !fully_explicit {
        if let Some(parsed) = parse_binding_name(&binding.name) {
            if binding.source.is_none() {
                binding.source = Some(parsed.source);
            }
            if binding.destination.is_none() {
                binding.destination = Some(parsed.destination);
            }
            keys = parsed.keys;
        }
    }
    for key in binding.binding_keys.take().into_iter().flatten() {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    if let Some(key) = binding.binding_key.take() {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    if keys.len() > 1 {
        let name = binding.name.clone();
        keys.into_iter()
            .map(|key| {
                let mut fanned = binding.clone();
                fanned.name = format!("{name}:{key}");
                fanned.binding_key = Some(key);
                fanned
            })
            .collect()
    } else {
        binding.binding_key = keys.into_iter().next();
        vec![binding]
    }
}

struct ParsedBindingName {
    source: String,
    keys: Vec<String>,
    destination: String,
}

/// Parses a binding name of the form `source[ key1, key2 ]-> destination`.
/// The bracketed key list is optional; keys are comma or whitespace
/// separated. Names that do not match the pattern yield `None`.
fn parse_binding_name(name: &str) -> Option<ParsedBindingName> {
    let (left, destination) = name.split_once("->")?;
    let destination = destination.trim();
    let left = left.trim();
    if left.is_empty() || destination.is_empty() {
        return None;
    }
    match left.split_once('[') {
        Some((source, keys)) => {
            let keys = keys.trim().strip_suffix(']')?;
            let keys = keys
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
            Some(ParsedBindingName {
                source: source.trim().to_string(),
                keys,
                destination: destination.to_string(),
            })
        }
        None => Some(ParsedBindingName {
            source: left.to_string(),
            keys: Vec::new(),
            destination: destination.to_string(),
        }),
    }
}

fn promote_publications(config: &mut BrokerConfig, vhost: &mut VhostConfig) -> Result<(), Error> {
    for (name, mut publication) in std::mem::take(&mut vhost.publications) {
        if config.publications.contains_key(&name) {
            return Err(Error::DuplicatePublication(name));
        }
        publication.vhost = Some(vhost.name.clone());
        config.publications.insert(name, publication);
    }
    Ok(())
}

fn promote_subscriptions(config: &mut BrokerConfig, vhost: &mut VhostConfig) -> Result<(), Error> {
    for (name, mut subscription) in std::mem::take(&mut vhost.subscriptions) {
        if config.subscriptions.contains_key(&name) {
            return Err(Error::DuplicateSubscription(name));
        }
        subscription.vhost = Some(vhost.name.clone());
        config.subscriptions.insert(name, subscription);
    }
    Ok(())
}

/// The name of a generated publication or subscription: `<vhost>/<entity>`,
/// collapsing to `/<entity>` for the default vhost.
fn default_entry_name(vhost: &str, entity: &str) -> String {
    if vhost == "/" {
        format!("/{entity}")
    } else {
        format!("{vhost}/{entity}")
    }
}

fn add_default_publications(config: &mut BrokerConfig) {
    let mut generated = BTreeMap::new();
    for (vhost_name, vhost) in &config.vhosts {
        for (exchange_name, _) in vhost.exchanges.iter() {
            let name = default_entry_name(vhost_name, exchange_name);
            generated.insert(
                name.clone(),
                PublicationConfig {
                    name,
                    vhost: Some(vhost_name.clone()),
                    exchange: Some(exchange_name.clone()),
                    auto_created: Some(true),
                    ..Default::default()
                },
            );
        }
        for (queue_name, _) in vhost.queues.iter() {
            let name = default_entry_name(vhost_name, queue_name);
            generated.insert(
                name.clone(),
                PublicationConfig {
                    name,
                    vhost: Some(vhost_name.clone()),
                    queue: Some(queue_name.clone()),
                    auto_created: Some(true),
                    ..Default::default()
                },
            );
        }
    }
    for (name, publication) in generated {
        config.publications.entry(name).or_insert(publication);
    }
}

fn add_default_subscriptions(config: &mut BrokerConfig) {
    let mut generated = BTreeMap::new();
    for (vhost_name, vhost) in &config.vhosts {
        for (queue_name, _) in vhost.queues.iter() {
            let name = default_entry_name(vhost_name, queue_name);
            generated.insert(
                name.clone(),
                SubscriptionConfig {
                    name,
                    vhost: Some(vhost_name.clone()),
                    queue: Some(queue_name.clone()),
                    auto_created: Some(true),
                    ..Default::default()
                },
            );
        }
    }
    for (name, subscription) in generated {
        config.subscriptions.entry(name).or_insert(subscription);
    }
}

fn configure_publications(config: &mut BrokerConfig) -> Result<(), Error> {
    let defaults = config
        .defaults
        .get("publications")
        .cloned()
        .unwrap_or(Value::Null);
    let names: Vec<String> = config.publications.keys().cloned().collect();
    for name in names {
        let Some(mut publication) = config.publications.remove(&name) else {
            continue;
        };
        publication.name = name.clone();
        let mut publication: PublicationConfig = apply_defaults(&publication, &defaults)?;
        if publication.exchange.is_none() && publication.queue.is_none() {
            publication.exchange = Some(String::new());
        }

        let vhost_name = publication.vhost.clone().unwrap_or_else(|| "/".to_string());
        if let Some(vhost) = config.vhosts.get(&vhost_name) {
            publication.destination = match (&publication.exchange, &publication.queue) {
                (Some(exchange), None) => vhost
                    .exchange(exchange)
                    .and_then(|exchange| exchange.fully_qualified_name.clone()),
                (None, Some(queue)) => vhost
                    .queue(queue)
                    .and_then(|queue| queue.fully_qualified_name.clone()),
                _ => None,
            };

            if let Some(reply_to) = publication.reply_to.clone() {
                if let Some(queue) = vhost.queue(&reply_to) {
                    publication.reply_to = queue.fully_qualified_name.clone();
                } else if !vhost.queues.iter().any(|(_, queue)| {
                    queue.fully_qualified_name.as_deref() == Some(reply_to.as_str())
                }) {
                    return Err(Error::UnknownReplyQueue {
                        publication: name,
                        queue: reply_to,
                    });
                }
            }
        }

        if let Some(EncryptionSpec::Name(profile)) = &publication.encryption {
            match config.encryption.get(profile) {
                Some(resolved) => {
                    publication.encryption = Some(EncryptionSpec::Profile(resolved.clone()));
                }
                None => {
                    return Err(Error::UnknownEncryptionProfile {
                        publication: name,
                        profile: profile.clone(),
                    });
                }
            }
        }

        config.publications.insert(name, publication);
    }
    Ok(())
}

fn configure_subscriptions(config: &mut BrokerConfig) -> Result<(), Error> {
    let defaults = config
        .defaults
        .get("subscriptions")
        .cloned()
        .unwrap_or(Value::Null);
    let names: Vec<String> = config.subscriptions.keys().cloned().collect();
    for name in names {
        let Some(mut subscription) = config.subscriptions.remove(&name) else {
            continue;
        };
        subscription.name = name.clone();
        let mut subscription: SubscriptionConfig = apply_defaults(&subscription, &defaults)?;

        let vhost_name = subscription
            .vhost
            .clone()
            .unwrap_or_else(|| "/".to_string());
        if let (Some(vhost), Some(queue)) =
            (config.vhosts.get(&vhost_name), subscription.queue.clone())
        {
            subscription.source = vhost
                .queue(&queue)
                .and_then(|queue| queue.fully_qualified_name.clone());
        }

        subscription.encryption = match subscription.encryption.take() {
            None if !config.encryption.is_empty() => {
                Some(SubscriptionEncryption::Keyring(config.encryption.clone()))
            }
            Some(SubscriptionEncryption::Name(profile)) => {
                let resolved = config.encryption.get(&profile).cloned().ok_or_else(|| {
                    Error::Configuration(format!(
                        "Subscription: {name} refers to an unknown encryption profile: {profile}"
                    ))
                })?;
                let mut keyring = BTreeMap::new();
                keyring.insert(profile, resolved);
                Some(SubscriptionEncryption::Keyring(keyring))
            }
            other => other,
        };

        config.subscriptions.insert(name, subscription);
    }
    Ok(())
}

fn configure_shovels(config: &mut BrokerConfig) -> Result<(), Error> {
    let mut resolved = BTreeMap::new();
    for (name, mut shovel) in normalize(&config.shovels) {
        shovel.name = name.clone();
        if let Some((subscription, publication)) = name.split_once("->") {
            if shovel.subscription.is_none() {
                shovel.subscription = Some(subscription.trim().to_string());
            }
            if shovel.publication.is_none() {
                shovel.publication = Some(publication.trim().to_string());
            }
        }
        resolved.insert(name, shovel);
    }
    config.shovels = EntrySet::Map(resolved);
    Ok(())
}

fn configure_counters(config: &mut BrokerConfig) -> Result<(), Error> {
    let defaults = config
        .defaults
        .pointer("/redeliveries/counters")
        .cloned()
        .unwrap_or(Value::Null);
    let mut resolved = BTreeMap::new();
    for (name, mut counter) in normalize(&config.redeliveries.counters) {
        counter.name = name.clone();
        if counter.kind.is_none() {
            counter.kind = Some(name.clone());
        }
        let kind_defaults = defaults.get(counter.kind()).cloned().unwrap_or(Value::Null);
        let counter: CounterConfig = apply_defaults(&counter, &kind_defaults)?;
        resolved.insert(name, counter);
    }
    config.redeliveries.counters = EntrySet::Map(resolved);
    Ok(())
}

/// Normalizes an entry collection to a mapping keyed by name. Sequence
/// entries may be bare names; anonymous entries receive an `unnamed-<uuid>`
/// key.
fn normalize<T: Named + Clone>(set: &EntrySet<T>) -> BTreeMap<String, T> {
    match set {
        EntrySet::Map(map) => map
            .iter()
            .map(|(name, item)| {
                let mut item = item.clone();
                item.set_name(name);
                (name.clone(), item)
            })
            .collect(),
        EntrySet::Seq(entries) => {
            let mut map = BTreeMap::new();
            for entry in entries {
                let mut item = match entry {
                    SeqEntry::Name(name) => T::with_name(name),
                    SeqEntry::Item(item) => item.clone(),
                };
                let name = if item.name().is_empty() {
                    format!("unnamed-{}", Uuid::new_v4())
                } else {
                    item.name().to_string()
                };
                item.set_name(&name);
                map.insert(name, item);
            }
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binding_names_without_keys() {
        let parsed = parse_binding_name("e1 -> q1").unwrap();
        assert_eq!(parsed.source, "e1");
        assert_eq!(parsed.destination, "q1");
        assert!(parsed.keys.is_empty());
    }

    #[test]
    fn parses_binding_names_with_keys() {
        let parsed = parse_binding_name("e1[ k1, k2 ]-> q1").unwrap();
        assert_eq!(parsed.source, "e1");
        assert_eq!(parsed.destination, "q1");
        assert_eq!(parsed.keys, vec!["k1", "k2"]);
    }

    #[test]
    fn parses_whitespace_separated_keys() {
        let parsed = parse_binding_name("e1[k1 k2 k3]-> q1").unwrap();
        assert_eq!(parsed.keys, vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn ignores_unpatterned_names() {
        assert!(parse_binding_name("b1").is_none());
    }

    #[test]
    fn fans_out_multiple_keys() {
        let binding = BindingConfig {
            name: "e1[ k1, k2 ]-> q1".to_string(),
            ..Default::default()
        };
        let expanded = expand_binding(binding);
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].name, "e1[ k1, k2 ]-> q1:k1");
        assert_eq!(expanded[0].binding_key.as_deref(), Some("k1"));
        assert_eq!(expanded[1].name, "e1[ k1, k2 ]-> q1:k2");
        assert_eq!(expanded[1].binding_key.as_deref(), Some("k2"));
    }

    #[test]
    fn unions_explicit_keys_with_parsed_keys() {
        let binding = BindingConfig {
            name: "e1[ k1 ]-> q1".to_string(),
            binding_keys: Some(vec!["k1".to_string(), "k2".to_string()]),
            ..Default::default()
        };
        let expanded = expand_binding(binding);
        assert_eq!(expanded.len(), 2);
    }

    #[test]
    fn fully_explicit_bindings_are_taken_as_is() {
        let binding = BindingConfig {
            name: "e1[ k1, k2 ]-> q1:k1".to_string(),
            source: Some("e1".to_string()),
            destination: Some("q1".to_string()),
            binding_key: Some("k1".to_string()),
            ..Default::default()
        };
        let expanded = expand_binding(binding);
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].name, "e1[ k1, k2 ]-> q1:k1");
        assert_eq!(expanded[0].binding_key.as_deref(), Some("k1"));
    }

    #[test]
    fn qualify_once_is_a_fixed_point() {
        assert_eq!(qualify_once("dlx", Some("ns")), "ns:dlx");
        assert_eq!(qualify_once("ns:dlx", Some("ns")), "ns:dlx");
        assert_eq!(qualify_once("", Some("ns")), "");
        assert_eq!(qualify_once("dlx", None), "dlx");
    }
}
