// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Configuration Schema
//!
//! Typed model of the configuration tree. User input is deliberately
//! under-specified: connections may be bare URL strings, namespaces and reply
//! queues may be the boolean sentinel `true`, and several collections accept
//! either a sequence of entries or a mapping keyed by name. The untagged enums
//! in this module absorb those shapes; the configurator normalizes them into
//! the fully resolved form the runtime consumes.
//!
//! All keys follow the camelCase convention of the external configuration
//! format. AMQP entity options (`options` fields) are kept as opaque JSON
//! objects and handed to the driver at assertion time.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Root of the configuration tree, before and after expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Virtual hosts, keyed by name.
    pub vhosts: BTreeMap<String, VhostConfig>,

    /// Publications, keyed by name. Vhost-local publications are promoted
    /// into this collection during expansion.
    pub publications: BTreeMap<String, PublicationConfig>,

    /// Subscriptions, keyed by name. Vhost-local subscriptions are promoted
    /// into this collection during expansion.
    pub subscriptions: BTreeMap<String, SubscriptionConfig>,

    /// Shovels bridging a subscription to a publication.
    pub shovels: EntrySet<ShovelConfig>,

    /// Redelivery counter declarations.
    pub redeliveries: RedeliveriesConfig,

    /// Encryption profiles, keyed by name.
    pub encryption: BTreeMap<String, EncryptionProfile>,

    /// Defaults applied to each entity during expansion.
    pub defaults: Value,
}

/// A collection that accepts either a sequence of entries (each a bare name
/// or an object) or a mapping keyed by name. Normalized to the mapping form
/// during expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntrySet<T> {
    Map(BTreeMap<String, T>),
    Seq(Vec<SeqEntry<T>>),
}

/// A single entry of a sequence-form collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeqEntry<T> {
    Name(String),
    Item(T),
}

impl<T> Default for EntrySet<T> {
    fn default() -> Self {
        EntrySet::Map(BTreeMap::new())
    }
}

impl<T> EntrySet<T> {
    /// The normalized mapping, or `None` when still in sequence form.
    pub fn as_map(&self) -> Option<&BTreeMap<String, T>> {
        match self {
            EntrySet::Map(map) => Some(map),
            EntrySet::Seq(_) => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, T>> {
        match self {
            EntrySet::Map(map) => Some(map),
            EntrySet::Seq(_) => None,
        }
    }

    /// Iterates the normalized entries. Empty before normalization.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.as_map().into_iter().flatten()
    }
}

/// Implemented by entities that carry their own name so sequence-form
/// collections can be keyed.
pub(crate) trait Named: Default {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);

    fn with_name(name: &str) -> Self {
        let mut entity = Self::default();
        entity.set_name(name);
        entity
    }
}

/// A vhost and the topology it owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VhostConfig {
    pub name: String,

    /// Prefix applied to entity names. The sentinel `true` requests a fresh
    /// UUID per configuration run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_strategy: Option<ConnectionStrategy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_channel_pools: Option<ChannelPoolsConfig>,

    /// Singular connection entry, folded into `connections` during expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionSpec>,

    /// Connection list, ordered by failover priority after expansion.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionSpec>,

    pub exchanges: EntrySet<ExchangeConfig>,
    pub queues: EntrySet<QueueConfig>,
    pub bindings: EntrySet<BindingConfig>,

    /// Vhost-local publications, promoted to the root during expansion.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub publications: BTreeMap<String, PublicationConfig>,

    /// Vhost-local subscriptions, promoted to the root during expansion.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub subscriptions: BTreeMap<String, SubscriptionConfig>,

    /// The `defaults.vhosts` block in force when this vhost was expanded,
    /// stashed for later per-entity lookups.
    #[serde(skip)]
    pub defaults: Value,
}

impl VhostConfig {
    /// The effective namespace, if one is configured.
    pub fn namespace(&self) -> Option<&str> {
        match &self.namespace {
            Some(Namespace::Name(name)) if !name.is_empty() => Some(name),
            _ => None,
        }
    }

    /// Looks up an exchange by logical name.
    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.as_map().and_then(|map| map.get(name))
    }

    /// Looks up a queue by logical name.
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.as_map().and_then(|map| map.get(name))
    }
}

/// Namespace field: the sentinel `true` requests a generated UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Namespace {
    Generated(bool),
    Name(String),
}

/// Order in which the connection list is tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStrategy {
    /// Input order.
    Fixed,
    /// Stable random order per host and port.
    Random,
}

/// Channel pool sizing for publications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelPoolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regular_pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_pool_size: Option<usize>,
}

/// A connection entry: either a bare AMQP URL or a detailed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionSpec {
    Url(String),
    Detailed(Box<ConnectionConfig>),
}

impl ConnectionSpec {
    /// The resolved connection object. `None` until expansion has run.
    pub fn as_config(&self) -> Option<&ConnectionConfig> {
        match self {
            ConnectionSpec::Detailed(config) => Some(config),
            ConnectionSpec::Url(_) => None,
        }
    }
}

/// A fully resolved broker connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// `url` with any password component replaced by `***`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loggable_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,

    /// Query string options appended to the composed URL.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub socket_options: Value,

    pub management: ManagementConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Marks URL components that are already percent-encoded and must not be
    /// re-encoded during composition.
    #[serde(skip_serializing_if = "PreEncoded::is_default")]
    pub pre_encoded: PreEncoded,

    /// Failover ordering, assigned and then stripped during expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<f64>,
}

/// Management API coordinates derived from the AMQP connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagementConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loggable_url: Option<String>,
}

/// Which URL components arrive already percent-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreEncoded {
    All(bool),
    Parts(PreEncodedParts),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreEncodedParts {
    pub auth: bool,
    pub pathname: bool,
    pub query: bool,
}

impl Default for PreEncoded {
    fn default() -> Self {
        PreEncoded::All(false)
    }
}

impl PreEncoded {
    pub(crate) fn is_default(&self) -> bool {
        *self == PreEncoded::All(false)
    }

    pub fn auth(&self) -> bool {
        match self {
            PreEncoded::All(all) => *all,
            PreEncoded::Parts(parts) => parts.auth,
        }
    }

    pub fn pathname(&self) -> bool {
        match self {
            PreEncoded::All(all) => *all,
            PreEncoded::Parts(parts) => parts.pathname,
        }
    }

    pub fn query(&self) -> bool {
        match self {
            PreEncoded::All(all) => *all,
            PreEncoded::Parts(parts) => parts.query,
        }
    }
}

/// Reconnection backoff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

/// An exchange declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fully_qualified_name: Option<String>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Declare the exchange at vhost initialization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assert: Option<bool>,

    /// Passively verify the exchange exists instead of declaring it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<bool>,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl Named for ExchangeConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

/// A queue declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fully_qualified_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assert: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<bool>,

    /// Purge the queue when the vhost initializes. Useful for test runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge: Option<bool>,

    /// Marks a reply queue. The sentinel `true` requests a generated tag that
    /// participates in name qualification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl QueueConfig {
    /// The reply queue tag, once generated.
    pub fn reply_to_tag(&self) -> Option<&str> {
        match &self.reply_to {
            Some(ReplyTo::Tag(tag)) => Some(tag),
            _ => None,
        }
    }
}

impl Named for QueueConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

/// Reply queue marker: `true` requests a generated tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyTo {
    Generated(bool),
    Tag(String),
}

/// A binding attaching a destination to a source exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindingConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<DestinationType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_key: Option<String>,

    /// Multiple keys fan out into one binding per key during expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_keys: Option<Vec<String>>,

    /// Qualify the binding key against the vhost namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualify_binding_keys: Option<bool>,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl Named for BindingConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DestinationType {
    Queue,
    Exchange,
}

/// A named routing endpoint the application publishes through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublicationConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Fully qualified name of the target entity, resolved during expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,

    /// Milliseconds to wait for broker confirmation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,

    /// Reply queue, rewritten to its fully qualified name during expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,

    /// Distinguishes generated entries from user-declared ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_created: Option<bool>,
}

impl PublicationConfig {
    pub fn is_auto_created(&self) -> bool {
        self.auto_created.unwrap_or(false)
    }

    /// The resolved encryption profile, if any.
    pub fn encryption_profile(&self) -> Option<&EncryptionProfile> {
        match &self.encryption {
            Some(EncryptionSpec::Profile(profile)) => Some(profile),
            _ => None,
        }
    }
}

impl Named for PublicationConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

/// Publication encryption: a profile name resolved against the root
/// `encryption` block, or an inline profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptionSpec {
    Name(String),
    Profile(EncryptionProfile),
}

/// A symmetric cipher profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncryptionProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Hex encoded key.
    pub key: String,

    /// Initialization vector length in bytes.
    pub iv_length: usize,

    /// Cipher spec, e.g. `aes-256-cbc`.
    pub algorithm: String,
}

/// A named consumer endpoint the application subscribes to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriptionConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Fully qualified name of the queue, resolved during expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Forces content decoding regardless of the message content type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefetch: Option<u16>,

    /// Milliseconds to keep the consumer channel open after cancellation
    /// while deliveries are still in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defer_close_channel: Option<u64>,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeliveries: Option<RedeliveriesPolicy>,

    /// Keyring used to decrypt incoming messages, defaulted from the root
    /// `encryption` block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<SubscriptionEncryption>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_created: Option<bool>,
}

impl SubscriptionConfig {
    pub fn is_auto_created(&self) -> bool {
        self.auto_created.unwrap_or(false)
    }

    /// The resolved decryption keyring. Empty when encryption is unused.
    pub fn keyring(&self) -> Option<&BTreeMap<String, EncryptionProfile>> {
        match &self.encryption {
            Some(SubscriptionEncryption::Keyring(keyring)) => Some(keyring),
            _ => None,
        }
    }
}

impl Named for SubscriptionConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

/// Subscription encryption: a single profile name or a keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionEncryption {
    Name(String),
    Keyring(BTreeMap<String, EncryptionProfile>),
}

/// Redelivery limits applied by a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedeliveriesPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<String>,
}

/// A subscription paired with a publication for message bridging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShovelConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<String>,
}

impl Named for ShovelConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

/// Redelivery counter declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedeliveriesConfig {
    pub counters: EntrySet<CounterConfig>,
}

/// A redelivery counter declaration. Counter specific options (for example
/// `size` for the in-memory counter) ride along unmodeled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CounterConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

impl CounterConfig {
    /// The counter implementation, defaulting to the counter's own name.
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }
}

impl Named for CounterConfig {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

/// Round-trips an entity through JSON to merge defaults underneath it.
pub(crate) fn apply_defaults<T>(entity: &T, defaults: &Value) -> Result<T, crate::errors::Error>
where
    T: Serialize + DeserializeOwned,
{
    let entity = serde_json::to_value(entity)
        .map_err(|err| crate::errors::Error::Configuration(err.to_string()))?;
    let merged = super::merge::deep_merge(defaults.clone(), entity);
    serde_json::from_value(merged).map_err(|err| crate::errors::Error::Configuration(err.to_string()))
}
