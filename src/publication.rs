// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Publications
//!
//! A [`Publication`] is a named routing endpoint resolved from configuration.
//! Publishing builds an envelope (payload, content type, message id, headers,
//! optional encryption), hands it to a pooled channel on the owning vhost and
//! returns a [`PublishReceipt`] whose events report the outcome: `Success`
//! once the broker has taken the message (after confirmation on confirm
//! channels), `Returned` when a mandatory message could not be routed, and
//! `Error` on failure. The `Success` event carries the time from the publish
//! call to broker acceptance.
//!
//! Forwarding re-publishes an inbound message, preserving its id and content
//! type and stamping headers that record where it came from.

use crate::config::{PublicationConfig, qualify};
use crate::crypto::Cipher;
use crate::errors::Error;
use crate::fields::{
    insert_nested, insert_root_values, to_field_table, HEADER_ENCRYPTION, HEADER_ENCRYPTION_IV,
    HEADER_ENCRYPTION_NAME, HEADER_ORIGINAL_CONTENT_TYPE, HEADER_ORIGINAL_EXCHANGE,
    HEADER_ORIGINAL_QUEUE, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RESTORE_ROUTING_HEADERS,
};
use crate::otel;
use crate::subscription::SubscriberMessage;
use crate::vhost::Vhost;
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use opentelemetry::Context;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

/// Default content type for raw byte payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// Default content type for text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Default content type for structured payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An outgoing payload. The content type defaults from the variant unless
/// overridden.
#[derive(Debug, Clone)]
pub enum Message {
    /// Raw bytes, published as `application/octet-stream`.
    Buffer(Vec<u8>),
    /// Text, published as `text/plain`.
    Text(String),
    /// A structured value, serialized as JSON.
    Json(Value),
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Json(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::Buffer(bytes)
    }
}

/// Per-publish overrides. Construct with `Default` and set what you need; a
/// bare routing key converts directly.
#[derive(Debug, Clone, Default)]
pub struct PublishOverrides {
    pub routing_key: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub persistent: Option<bool>,
    /// Extra headers merged over the configured ones.
    pub headers: Option<Value>,
}

impl From<&str> for PublishOverrides {
    fn from(routing_key: &str) -> Self {
        PublishOverrides {
            routing_key: Some(routing_key.to_string()),
            ..Default::default()
        }
    }
}

/// Events reported for one published message.
#[derive(Debug)]
pub enum PublicationEvent {
    /// The broker took the message. `duration` measures from the publish
    /// call to acceptance.
    Success {
        message_id: String,
        duration: Duration,
    },
    /// A mandatory message could not be routed and came back.
    Returned(Box<BasicReturnMessage>),
    /// The publish failed.
    Error { message_id: String, error: Error },
}

/// Handle for one published message.
pub struct PublishReceipt {
    message_id: String,
    events: mpsc::UnboundedReceiver<PublicationEvent>,
}

impl PublishReceipt {
    /// The message id stamped on (or carried over to) the outgoing message.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Waits for the next outcome event.
    ///
    /// # Returns
    /// The next [`PublicationEvent`], or `None` once every event for this
    /// message has been delivered
    pub async fn next(&mut self) -> Option<PublicationEvent> {
        self.events.recv().await
    }
}

/// A live publication bound to its vhost.
pub struct Publication {
    config: PublicationConfig,
    vhost: Arc<Vhost>,
    cipher: Arc<dyn Cipher>,
}

impl Publication {
    pub(crate) fn new(
        config: PublicationConfig,
        vhost: Arc<Vhost>,
        cipher: Arc<dyn Cipher>,
    ) -> Publication {
        Publication {
            config,
            vhost,
            cipher,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PublicationConfig {
        &self.config
    }

    /// Publishes a message through this publication.
    ///
    /// # Parameters
    /// * `message` - The payload; text, structured or raw bytes
    /// * `overrides` - Per-publish overrides
    ///
    /// # Returns
    /// * `Result<PublishReceipt, Error>` - A receipt carrying the message id
    ///   and the outcome events, or an error when the envelope could not be
    ///   built or the channel rejected the publish
    pub async fn publish(
        &self,
        message: &Message,
        overrides: &PublishOverrides,
    ) -> Result<PublishReceipt, Error> {
        if self.config.deprecated.unwrap_or(false) {
            warn!("publication: {} is deprecated", self.config.name);
        }
        let started = Instant::now();
        let envelope = build_envelope(&self.config, self.cipher.as_ref(), message, overrides)?;
        self.dispatch(envelope, started).await
    }

    /// Re-publishes an inbound message, preserving its identity and stamping
    /// origin headers.
    ///
    /// # Parameters
    /// * `message` - The message as delivered to a subscriber session
    /// * `overrides` - Per-publish overrides; without a routing key here or
    ///   on the publication, the original routing key is reused
    ///
    /// # Returns
    /// * `Result<PublishReceipt, Error>` - A receipt carrying the original
    ///   message id and the outcome events
    pub async fn forward(
        &self,
        message: &SubscriberMessage,
        overrides: &PublishOverrides,
    ) -> Result<PublishReceipt, Error> {
        let started = Instant::now();
        let envelope = build_forward_envelope(&self.config, message, overrides);
        self.dispatch(envelope, started).await
    }

    async fn dispatch(
        &self,
        envelope: Envelope,
        started: Instant,
    ) -> Result<PublishReceipt, Error> {
        let confirm = self.config.confirm.unwrap_or(false);
        let channel = self.vhost.publish_channel(confirm).await?;

        let promise = channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions {
                    mandatory: envelope.mandatory,
                    immediate: false,
                },
                &envelope.body,
                envelope.properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                Error::Publish(self.config.name.clone())
            })?;

        let (events, receiver) = mpsc::unbounded_channel();
        let message_id = envelope.message_id.clone();
        let name = self.config.name.clone();
        let timeout = self.config.timeout;

        tokio::spawn(async move {
            let confirmation = match timeout {
                Some(millis) => {
                    match tokio::time::timeout(Duration::from_millis(millis), promise).await {
                        Ok(confirmation) => confirmation,
                        Err(_) => {
                            let _ = events.send(PublicationEvent::Error {
                                message_id,
                                error: Error::Publish(name),
                            });
                            return;
                        }
                    }
                }
                None => promise.await,
            };

            match confirmation {
                Ok(Confirmation::NotRequested) => {
                    let _ = events.send(PublicationEvent::Success {
                        message_id,
                        duration: started.elapsed(),
                    });
                }
                Ok(Confirmation::Ack(returned)) => {
                    if let Some(returned) = returned {
                        let _ = events.send(PublicationEvent::Returned(returned));
                    }
                    let _ = events.send(PublicationEvent::Success {
                        message_id,
                        duration: started.elapsed(),
                    });
                }
                Ok(Confirmation::Nack(returned)) => {
                    if let Some(returned) = returned {
                        let _ = events.send(PublicationEvent::Returned(returned));
                    }
                    error!("message was nacked by the broker");
                    let _ = events.send(PublicationEvent::Error {
                        message_id,
                        error: Error::Publish(name),
                    });
                }
                Err(err) => {
                    error!(error = err.to_string(), "error awaiting confirmation");
                    let _ = events.send(PublicationEvent::Error {
                        message_id,
                        error: Error::Publish(name),
                    });
                }
            }
        });

        Ok(PublishReceipt {
            message_id: envelope.message_id,
            events: receiver,
        })
    }
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) mandatory: bool,
    pub(crate) properties: BasicProperties,
    pub(crate) body: Vec<u8>,
    pub(crate) message_id: String,
}

/// Builds the outgoing envelope for a fresh publish. Pure apart from message
/// id and IV generation.
pub(crate) fn build_envelope(
    config: &PublicationConfig,
    cipher: &dyn Cipher,
    message: &Message,
    overrides: &PublishOverrides,
) -> Result<Envelope, Error> {
    let (exchange, routing_key) = route(config, overrides, None);

    let (mut body, default_content_type) = match message {
        Message::Buffer(bytes) => (bytes.clone(), OCTET_STREAM_CONTENT_TYPE),
        Message::Text(text) => (text.clone().into_bytes(), TEXT_CONTENT_TYPE),
        Message::Json(value) => (
            serde_json::to_vec(value).map_err(|err| Error::Publish(err.to_string()))?,
            JSON_CONTENT_TYPE,
        ),
    };
    let mut content_type = overrides
        .content_type
        .clone()
        .or_else(|| {
            config
                .options
                .get("contentType")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| default_content_type.to_string());

    let message_id = overrides
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut headers: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
    otel::inject_context(&Context::current(), &mut headers);
    merge_headers(&mut headers, config.options.get("headers"));
    merge_headers(&mut headers, overrides.headers.as_ref());

    if let Some(profile) = config.encryption_profile() {
        let (iv, ciphertext) = cipher.encrypt(profile, &body)?;
        let mut block = BTreeMap::new();
        block.insert(
            ShortString::from(HEADER_ENCRYPTION_NAME),
            AMQPValue::LongString(profile.name.clone().unwrap_or_default().into()),
        );
        block.insert(
            ShortString::from(HEADER_ENCRYPTION_IV),
            AMQPValue::LongString(iv.into()),
        );
        block.insert(
            ShortString::from(HEADER_ORIGINAL_CONTENT_TYPE),
            AMQPValue::LongString(content_type.clone().into()),
        );
        insert_nested(&mut headers, HEADER_ENCRYPTION, block);
        body = ciphertext;
        content_type = OCTET_STREAM_CONTENT_TYPE.to_string();
    }

    let persistent = overrides
        .persistent
        .unwrap_or_else(|| option_flag(&config.options, "persistent"));
    let mut properties = BasicProperties::default()
        .with_content_type(content_type.into())
        .with_message_id(message_id.clone().into())
        .with_headers(FieldTable::from(headers))
        .with_delivery_mode(if persistent { 2 } else { 1 });
    if let Some(expiration) = expiration(config, overrides) {
        properties = properties.with_expiration(expiration.into());
    }
    if let Some(priority) = overrides.priority.or_else(|| {
        config
            .options
            .get("priority")
            .and_then(Value::as_u64)
            .map(|priority| priority as u8)
    }) {
        properties = properties.with_priority(priority);
    }

    Ok(Envelope {
        exchange,
        routing_key,
        mandatory: option_flag(&config.options, "mandatory"),
        properties,
        body,
        message_id,
    })
}

/// Builds the envelope for a forward: the inbound properties are carried
/// over, origin headers are stamped, and the original routing key is the
/// fallback.
pub(crate) fn build_forward_envelope(
    config: &PublicationConfig,
    message: &SubscriberMessage,
    overrides: &PublishOverrides,
) -> Envelope {
    let (exchange, routing_key) = route(config, overrides, Some(&message.routing_key));

    let mut properties = message.properties.clone();
    let message_id = match properties.message_id().clone() {
        Some(message_id) => message_id.to_string(),
        None => {
            let message_id = Uuid::new_v4().to_string();
            properties = properties.with_message_id(message_id.clone().into());
            message_id
        }
    };

    let mut headers = properties
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();
    otel::inject_context(&Context::current(), &mut headers);
    insert_root_values(
        &mut headers,
        vec![
            (
                HEADER_ORIGINAL_QUEUE,
                AMQPValue::LongString(
                    qualify(&message.queue, message.namespace.as_deref(), None).into(),
                ),
            ),
            (
                HEADER_ORIGINAL_EXCHANGE,
                AMQPValue::LongString(message.exchange.clone().into()),
            ),
            (
                HEADER_ORIGINAL_ROUTING_KEY,
                AMQPValue::LongString(message.routing_key.clone().into()),
            ),
            (HEADER_RESTORE_ROUTING_HEADERS, AMQPValue::Boolean(false)),
        ],
    );
    merge_headers(&mut headers, overrides.headers.as_ref());
    properties = properties.with_headers(FieldTable::from(headers));

    if let Some(persistent) = overrides.persistent {
        properties = properties.with_delivery_mode(if persistent { 2 } else { 1 });
    }
    if let Some(expiration) = overrides.expiration.clone() {
        properties = properties.with_expiration(expiration.into());
    }

    Envelope {
        exchange,
        routing_key,
        mandatory: option_flag(&config.options, "mandatory"),
        properties,
        body: message.data.clone(),
        message_id,
    }
}

/// Publications targeting a queue publish through the default exchange with
/// the queue as the routing key; exchange publications use the configured or
/// overridden routing key, falling back to the original on forwards.
fn route(
    config: &PublicationConfig,
    overrides: &PublishOverrides,
    original: Option<&str>,
) -> (String, String) {
    let destination = config.destination.clone().unwrap_or_default();
    if config.queue.is_some() {
        (String::new(), destination)
    } else {
        let routing_key = overrides
            .routing_key
            .clone()
            .or_else(|| config.routing_key.clone())
            .or_else(|| original.map(str::to_string))
            .unwrap_or_default();
        (destination, routing_key)
    }
}

fn merge_headers(headers: &mut BTreeMap<ShortString, AMQPValue>, extra: Option<&Value>) {
    let Some(extra) = extra else {
        return;
    };
    for (key, value) in to_field_table(extra).inner() {
        headers.insert(key.clone(), value.clone());
    }
}

fn expiration(config: &PublicationConfig, overrides: &PublishOverrides) -> Option<String> {
    overrides.expiration.clone().or_else(|| {
        config.options.get("expiration").map(|value| match value {
            Value::String(value) => value.clone(),
            other => other.to_string(),
        })
    })
}

fn option_flag(options: &Value, key: &str) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionProfile, EncryptionSpec};
    use crate::crypto::AesCbcCipher;
    use crate::fields::{nested_string, HEADER_ROOT};
    use serde_json::json;

    fn publication(options: Value) -> PublicationConfig {
        PublicationConfig {
            name: "p1".to_string(),
            vhost: Some("/".to_string()),
            exchange: Some("e1".to_string()),
            destination: Some("ns:e1".to_string()),
            options,
            ..Default::default()
        }
    }

    fn header_string(properties: &BasicProperties, path: &[&str]) -> Option<String> {
        properties
            .headers()
            .as_ref()
            .and_then(|headers| nested_string(headers, path))
    }

    #[test]
    fn text_payloads_default_to_text_plain() {
        let envelope = build_envelope(
            &publication(Value::Null),
            &AesCbcCipher,
            &Message::from("hello"),
            &PublishOverrides::default(),
        )
        .unwrap();
        assert_eq!(
            envelope.properties.content_type().clone().unwrap().as_str(),
            TEXT_CONTENT_TYPE
        );
        assert_eq!(envelope.body, b"hello");
        assert_eq!(envelope.exchange, "ns:e1");
    }

    #[test]
    fn structured_payloads_are_serialized_as_json() {
        let envelope = build_envelope(
            &publication(Value::Null),
            &AesCbcCipher,
            &Message::from(json!({ "answer": 42 })),
            &PublishOverrides::default(),
        )
        .unwrap();
        assert_eq!(
            envelope.properties.content_type().clone().unwrap().as_str(),
            JSON_CONTENT_TYPE
        );
        assert_eq!(envelope.body, br#"{"answer":42}"#);
    }

    #[test]
    fn raw_payloads_default_to_octet_stream() {
        let envelope = build_envelope(
            &publication(Value::Null),
            &AesCbcCipher,
            &Message::Buffer(vec![1, 2, 3]),
            &PublishOverrides::default(),
        )
        .unwrap();
        assert_eq!(
            envelope.properties.content_type().clone().unwrap().as_str(),
            OCTET_STREAM_CONTENT_TYPE
        );
    }

    #[test]
    fn explicit_overrides_always_win() {
        let overrides = PublishOverrides {
            message_id: Some("m1".to_string()),
            content_type: Some("text/csv".to_string()),
            routing_key: Some("rk2".to_string()),
            ..Default::default()
        };
        let envelope = build_envelope(
            &publication(Value::Null),
            &AesCbcCipher,
            &Message::from("a,b"),
            &overrides,
        )
        .unwrap();
        assert_eq!(envelope.message_id, "m1");
        assert_eq!(
            envelope.properties.content_type().clone().unwrap().as_str(),
            "text/csv"
        );
        assert_eq!(envelope.routing_key, "rk2");
    }

    #[test]
    fn fresh_message_ids_are_stamped() {
        let envelope = build_envelope(
            &publication(Value::Null),
            &AesCbcCipher,
            &Message::from("hello"),
            &PublishOverrides::default(),
        )
        .unwrap();
        assert!(!envelope.message_id.is_empty());
        assert_eq!(
            envelope.properties.message_id().clone().unwrap().as_str(),
            envelope.message_id
        );
    }

    #[test]
    fn queue_publications_route_through_the_default_exchange() {
        let config = PublicationConfig {
            name: "p1".to_string(),
            queue: Some("q1".to_string()),
            destination: Some("ns:q1".to_string()),
            ..Default::default()
        };
        let envelope = build_envelope(
            &config,
            &AesCbcCipher,
            &Message::from("hello"),
            &PublishOverrides::default(),
        )
        .unwrap();
        assert_eq!(envelope.exchange, "");
        assert_eq!(envelope.routing_key, "ns:q1");
    }

    #[test]
    fn persistent_publications_use_delivery_mode_two() {
        let envelope = build_envelope(
            &publication(json!({ "persistent": true, "mandatory": true })),
            &AesCbcCipher,
            &Message::from("hello"),
            &PublishOverrides::default(),
        )
        .unwrap();
        assert_eq!(envelope.properties.delivery_mode().clone().unwrap(), 2);
        assert!(envelope.mandatory);
    }

    #[test]
    fn encryption_wraps_the_payload() {
        let mut config = publication(Value::Null);
        config.encryption = Some(EncryptionSpec::Profile(EncryptionProfile {
            name: Some("well-known".to_string()),
            key: "ab".repeat(32),
            iv_length: 16,
            algorithm: "aes-256-cbc".to_string(),
        }));
        let envelope = build_envelope(
            &config,
            &AesCbcCipher,
            &Message::from("test message"),
            &PublishOverrides::default(),
        )
        .unwrap();

        assert_eq!(
            envelope.properties.content_type().clone().unwrap().as_str(),
            OCTET_STREAM_CONTENT_TYPE
        );
        assert_ne!(envelope.body, b"test message");
        assert_eq!(
            header_string(
                &envelope.properties,
                &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ENCRYPTION_NAME]
            ),
            Some("well-known".to_string())
        );
        let iv = header_string(
            &envelope.properties,
            &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ENCRYPTION_IV],
        )
        .unwrap();
        assert_eq!(iv.len(), 32);
        assert_eq!(
            header_string(
                &envelope.properties,
                &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ORIGINAL_CONTENT_TYPE]
            ),
            Some(TEXT_CONTENT_TYPE.to_string())
        );
    }

    #[test]
    fn encryption_with_a_bad_key_fails_the_publish() {
        let mut config = publication(Value::Null);
        config.encryption = Some(EncryptionSpec::Profile(EncryptionProfile {
            name: Some("short".to_string()),
            key: "ab".repeat(8),
            iv_length: 16,
            algorithm: "aes-256-cbc".to_string(),
        }));
        let err = build_envelope(
            &config,
            &AesCbcCipher,
            &Message::from("test message"),
            &PublishOverrides::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid key length");
    }

    #[test]
    fn forwards_preserve_identity_and_stamp_origin_headers() {
        let inbound = SubscriberMessage {
            properties: BasicProperties::default()
                .with_message_id("m1".into())
                .with_content_type(TEXT_CONTENT_TYPE.into()),
            data: b"test message".to_vec(),
            exchange: "ns:e1".to_string(),
            routing_key: "rk1".to_string(),
            redelivered: false,
            queue: "q1".to_string(),
            namespace: Some("ns".to_string()),
        };
        let config = PublicationConfig {
            name: "p2".to_string(),
            exchange: Some("e2".to_string()),
            destination: Some("ns:e2".to_string()),
            ..Default::default()
        };
        let envelope =
            build_forward_envelope(&config, &inbound, &PublishOverrides::default());

        assert_eq!(envelope.message_id, "m1");
        assert_eq!(
            envelope.properties.content_type().clone().unwrap().as_str(),
            TEXT_CONTENT_TYPE
        );
        assert_eq!(envelope.routing_key, "rk1");
        assert_eq!(
            header_string(&envelope.properties, &[HEADER_ROOT, HEADER_ORIGINAL_QUEUE]),
            Some("ns:q1".to_string())
        );
        assert_eq!(
            header_string(
                &envelope.properties,
                &[HEADER_ROOT, HEADER_ORIGINAL_EXCHANGE]
            ),
            Some("ns:e1".to_string())
        );
        assert_eq!(
            header_string(
                &envelope.properties,
                &[HEADER_ROOT, HEADER_ORIGINAL_ROUTING_KEY]
            ),
            Some("rk1".to_string())
        );
        let headers = envelope.properties.headers().clone().unwrap_or_default();
        match headers
            .inner()
            .get(&ShortString::from(HEADER_ROOT))
        {
            Some(AMQPValue::FieldTable(root)) => {
                assert_eq!(
                    root.inner()
                        .get(&ShortString::from(HEADER_RESTORE_ROUTING_HEADERS)),
                    Some(&AMQPValue::Boolean(false))
                );
            }
            other => panic!("expected origin header block, got {other:?}"),
        }
    }

    #[test]
    fn forward_routing_key_overrides_beat_the_original() {
        let inbound = SubscriberMessage {
            properties: BasicProperties::default(),
            data: Vec::new(),
            exchange: "e1".to_string(),
            routing_key: "rk1".to_string(),
            redelivered: false,
            queue: "q1".to_string(),
            namespace: None,
        };
        let mut config = PublicationConfig {
            name: "p2".to_string(),
            exchange: Some("e2".to_string()),
            destination: Some("e2".to_string()),
            ..Default::default()
        };
        config.routing_key = Some("configured".to_string());
        let envelope =
            build_forward_envelope(&config, &inbound, &PublishOverrides::default());
        assert_eq!(envelope.routing_key, "configured");
    }
}
