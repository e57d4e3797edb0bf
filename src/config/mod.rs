// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Configuration Pipeline
//!
//! Turns a possibly sparse user configuration into the fully resolved
//! topology the broker runtime consumes. The pipeline has two phases:
//!
//! 1. [`configure`] deep-merges the user tree on top of the built-in
//!    baseline, then expands it: connections are normalized and ordered,
//!    entity names are qualified against their vhost namespace, bindings fan
//!    out per key, vhost-local publications and subscriptions are promoted,
//!    and default publications and subscriptions are generated for every
//!    exchange and queue.
//! 2. [`validate`] runs a second pass enforcing the semantic rules that
//!    cannot be expressed as merges.
//!
//! Both phases are synchronous and never touch the network.

pub mod baseline;
mod configure;
mod connections;
pub mod merge;
mod schema;
mod validate;

pub use configure::configure;
pub use schema::{
    BindingConfig, BrokerConfig, ChannelPoolsConfig, ConnectionConfig, ConnectionSpec,
    ConnectionStrategy, CounterConfig, DestinationType, EncryptionProfile, EncryptionSpec,
    EntrySet, ExchangeConfig, ManagementConfig, Namespace, PreEncoded, PreEncodedParts,
    PublicationConfig, QueueConfig, RedeliveriesConfig, RedeliveriesPolicy, ReplyTo, RetryConfig,
    SeqEntry, ShovelConfig, SubscriptionConfig, SubscriptionEncryption, VhostConfig,
};
pub use validate::{validate, validate_with};

/// Qualifies an entity name against a vhost namespace, with an optional
/// uniqueness tag.
///
/// # Parameters
/// * `name` - The logical entity name
/// * `namespace` - The vhost namespace, if one is configured
/// * `tag` - An extra uniqueness tag, used by reply queues
///
/// # Returns
/// The name as used on the wire: `namespace:name[:tag]`. The nameless
/// default exchange is returned unchanged, and an empty namespace is the
/// identity.
pub fn qualify(name: &str, namespace: Option<&str>, tag: Option<&str>) -> String {
    if name.is_empty() {
        return name.to_string();
    }
    let qualified = match namespace {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}:{name}"),
        _ => name.to_string(),
    };
    match tag {
        Some(tag) => format!("{qualified}:{tag}"),
        None => qualified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_prefixes_namespace() {
        assert_eq!(qualify("q1", Some("ns"), None), "ns:q1");
    }

    #[test]
    fn qualify_appends_tag() {
        assert_eq!(qualify("q1", Some("ns"), Some("tag")), "ns:q1:tag");
        assert_eq!(qualify("q1", None, Some("tag")), "q1:tag");
    }

    #[test]
    fn empty_namespace_is_identity() {
        assert_eq!(qualify("q1", None, None), "q1");
        assert_eq!(qualify("q1", Some(""), None), "q1");
    }

    #[test]
    fn default_exchange_is_never_qualified() {
        assert_eq!(qualify("", Some("ns"), None), "");
        assert_eq!(qualify("", Some("ns"), Some("tag")), "");
    }
}
