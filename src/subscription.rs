// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Subscriber Sessions
//!
//! A [`SubscriberSession`] is created per `subscribe` and owns a dedicated
//! consumer channel. Deliveries arrive as events carrying the raw message,
//! the decoded content and an [`Acker`] that settles the message exactly
//! once. The session decrypts payloads using the subscription keyring,
//! decodes content by content type, and enforces the redelivery limit
//! through the configured counter.
//!
//! `cancel` is idempotent and safe while deliveries are in flight: the
//! consumer is cancelled immediately and the channel close is deferred while
//! unsettled deliveries remain, up to the configured horizon.

use crate::config::{qualify, SubscriptionConfig};
use crate::counter::RedeliveryCounter;
use crate::crypto::Cipher;
use crate::errors::Error;
use crate::fields::{
    nested_string, HEADER_ENCRYPTION, HEADER_ENCRYPTION_IV, HEADER_ENCRYPTION_NAME,
    HEADER_ORIGINAL_CONTENT_TYPE, HEADER_ROOT,
};
use crate::otel;
use crate::vhost::Vhost;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use opentelemetry::{global, KeyValue};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-subscribe overrides. Construct with `Default` and set what you need.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOverrides {
    pub prefetch: Option<u16>,
    /// Forces content decoding regardless of the message content type.
    pub content_type: Option<String>,
}

/// A message as delivered to the application.
#[derive(Debug, Clone)]
pub struct SubscriberMessage {
    pub properties: BasicProperties,
    /// Raw payload, decrypted when the message carried an encryption header.
    pub data: Vec<u8>,
    /// Exchange the message arrived through, as named on the wire.
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// Logical name of the queue the subscription consumes.
    pub queue: String,
    pub(crate) namespace: Option<String>,
}

impl SubscriberMessage {
    pub fn message_id(&self) -> Option<String> {
        self.properties
            .message_id()
            .clone()
            .map(|message_id| message_id.to_string())
    }
}

/// Decoded message content.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(Value),
    Text(String),
    Buffer(Vec<u8>),
}

/// Settles a delivery exactly once. A second ack or nack is an error rather
/// than a protocol violation.
pub struct Acker {
    inner: lapin::acker::Acker,
    settled: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl Acker {
    fn new(inner: lapin::acker::Acker, in_flight: Arc<AtomicUsize>) -> Acker {
        Acker {
            inner,
            settled: AtomicBool::new(false),
            in_flight,
        }
    }

    /// Acknowledges the message.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once the broker has the ack, or an error
    ///   when the message was already settled or the channel refused it
    pub async fn ack(&self) -> Result<(), Error> {
        self.settle()?;
        self.inner
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                Error::Ack
            })
    }

    /// Rejects the message.
    ///
    /// # Parameters
    /// * `requeue` - Return the message to the queue instead of discarding
    ///   it (or dead-lettering it, when the queue is configured for that)
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once the broker has the nack, or an error
    ///   when the message was already settled or the channel refused it
    pub async fn nack(&self, requeue: bool) -> Result<(), Error> {
        self.settle()?;
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                Error::Nack
            })
    }

    fn settle(&self) -> Result<(), Error> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyAcknowledged);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        // an unsettled delivery no longer counts as in flight once dropped
        if !self.settled.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Events emitted by a subscriber session.
pub enum SessionEvent {
    /// A delivery: the raw message, its decoded content and the acker.
    Message {
        message: SubscriberMessage,
        content: Content,
        acker: Acker,
    },
    /// A failure affecting one delivery or the consumer itself.
    Error(Error),
    /// The consumer has been cancelled; no further events follow.
    Cancelled,
}

/// The live consumer resulting from a subscribe.
pub struct SubscriberSession {
    pub(crate) control: Arc<SessionControl>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SubscriberSession {
    pub fn name(&self) -> &str {
        &self.control.name
    }

    /// Waits for the next session event.
    ///
    /// # Returns
    /// The next [`SessionEvent`], or `None` once the session has cancelled
    /// and drained
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Cancels the consumer. Idempotent, and safe during delivery.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once the consumer is cancelled; the
    ///   channel close is deferred while deliveries are still in flight
    pub async fn cancel(&self) -> Result<(), Error> {
        self.control.cancel().await
    }
}

pub(crate) struct SessionControl {
    name: String,
    consumer_tag: String,
    channel: Channel,
    cancelled: AtomicBool,
    defer_close_channel: Duration,
    in_flight: Arc<AtomicUsize>,
    defer_horizon: Mutex<Option<Instant>>,
}

impl SessionControl {
    pub(crate) async fn cancel(&self) -> Result<(), Error> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("cancelling subscriber session: {}", self.name);
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error cancelling consumer");
                Error::Consume(self.name.clone())
            })?;

        if self.in_flight.load(Ordering::SeqCst) > 0 {
            let horizon = Instant::now() + self.defer_close_channel;
            *self.defer_horizon.lock().expect("defer horizon") = Some(horizon);
            let channel = self.channel.clone();
            let defer = self.defer_close_channel;
            let name = self.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(defer).await;
                debug!("closing deferred channel for session: {}", name);
                if let Err(err) = channel.close(200, "Goodbye").await {
                    warn!(error = err.to_string(), "error closing channel");
                }
            });
        } else if let Err(err) = self.channel.close(200, "Goodbye").await {
            warn!(error = err.to_string(), "error closing channel");
        }
        Ok(())
    }

    /// How much of the close deferral window is still outstanding.
    pub(crate) fn defer_close_remaining(&self) -> Duration {
        self.defer_horizon
            .lock()
            .expect("defer horizon")
            .map(|horizon| horizon.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

struct DeliveryContext {
    name: String,
    queue: String,
    namespace: Option<String>,
    keyring: BTreeMap<String, crate::config::EncryptionProfile>,
    content_type: Option<String>,
    redelivery_limit: u64,
    counter: Arc<dyn RedeliveryCounter>,
    cipher: Arc<dyn Cipher>,
    in_flight: Arc<AtomicUsize>,
}

/// Creates a consumer for the subscription and spawns its delivery loop.
pub(crate) async fn subscribe(
    config: &SubscriptionConfig,
    vhost: Arc<Vhost>,
    counter: Arc<dyn RedeliveryCounter>,
    cipher: Arc<dyn Cipher>,
    overrides: &SubscribeOverrides,
) -> Result<SubscriberSession, Error> {
    if config.deprecated.unwrap_or(false) {
        warn!("subscription: {} is deprecated", config.name);
    }
    let channel = vhost.create_channel().await?;

    if let Some(prefetch) = overrides.prefetch.or(config.prefetch) {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error configuring qos");
                Error::Consume(config.name.clone())
            })?;
    }

    let source = config
        .source
        .clone()
        .or_else(|| config.queue.clone())
        .ok_or_else(|| Error::Consume(config.name.clone()))?;
    let consumer_tag = format!("{}:{}", config.name, Uuid::new_v4());

    debug!("consuming from queue: {}", source);
    let mut consumer = channel
        .basic_consume(
            &source,
            &consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: option_flag(&config.options, "noAck"),
                exclusive: option_flag(&config.options, "exclusive"),
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to create the consumer");
            Error::Consume(config.name.clone())
        })?;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let control = Arc::new(SessionControl {
        name: config.name.clone(),
        consumer_tag,
        channel,
        cancelled: AtomicBool::new(false),
        defer_close_channel: Duration::from_millis(config.defer_close_channel.unwrap_or(10000)),
        in_flight: in_flight.clone(),
        defer_horizon: Mutex::new(None),
    });

    let context = DeliveryContext {
        name: config.name.clone(),
        queue: config.queue.clone().unwrap_or_default(),
        namespace: vhost.namespace().map(str::to_string),
        keyring: config.keyring().cloned().unwrap_or_default(),
        content_type: overrides.content_type.clone().or_else(|| config.content_type.clone()),
        redelivery_limit: config
            .redeliveries
            .as_ref()
            .and_then(|redeliveries| redeliveries.limit)
            .unwrap_or(100),
        counter,
        cipher,
        in_flight,
    };

    let (events, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = handle_delivery(delivery, &context, &events).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    let _ = events.send(SessionEvent::Error(Error::Consume(context.name.clone())));
                }
            }
        }
        let _ = events.send(SessionEvent::Cancelled);
    });

    Ok(SubscriberSession {
        control,
        events: receiver,
    })
}

async fn handle_delivery(
    delivery: Delivery,
    context: &DeliveryContext,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), Error> {
    let Delivery {
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    // join the producer's trace before anything can fail or settle
    let parent = otel::extract_context(&properties);
    let tracer = global::tracer("warren");
    let mut span = tracer
        .span_builder(format!("subscribe:{}", context.name))
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new("subscription", context.name.clone()),
            KeyValue::new(
                "queue",
                qualify(&context.queue, context.namespace.as_deref(), None),
            ),
            KeyValue::new("redelivered", redelivered),
        ])
        .start_with_context(&tracer, &parent);

    debug!(
        "received message from queue: {} - exchange: {}",
        context.queue, exchange
    );

    let message_id = properties
        .message_id()
        .clone()
        .map(|message_id| message_id.to_string());

    // Redelivery accounting needs a stable message identity
    if redelivered {
        if let Some(message_id) = &message_id {
            let count = context.counter.increment_and_get(message_id).await;
            if count > context.redelivery_limit {
                let err = Error::RedeliveriesExceeded(message_id.clone());
                warn!("too many redeliveries of message: {}", message_id);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                let _ = events.send(SessionEvent::Error(err));
                return acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error whiling nack msg");
                        Error::Nack
                    });
            }
        }
    }

    let mut data = data;
    let mut content_type = properties
        .content_type()
        .clone()
        .map(|content_type| content_type.to_string());

    if let Some(headers) = properties.headers() {
        if let Some(profile_name) =
            nested_string(headers, &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ENCRYPTION_NAME])
        {
            let Some(profile) = context.keyring.get(&profile_name) else {
                let err = Error::Decryption(profile_name);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                let _ = events.send(SessionEvent::Error(err));
                return acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                    .map_err(|_| Error::Nack);
            };
            let iv = nested_string(
                headers,
                &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ENCRYPTION_IV],
            )
            .unwrap_or_default();
            match context.cipher.decrypt(profile, &iv, &data) {
                Ok(plaintext) => {
                    data = plaintext;
                    content_type = nested_string(
                        headers,
                        &[HEADER_ROOT, HEADER_ENCRYPTION, HEADER_ORIGINAL_CONTENT_TYPE],
                    )
                    .or(content_type);
                }
                Err(err) => {
                    span.set_status(Status::Error {
                        description: Cow::from(err.to_string()),
                    });
                    let _ = events.send(SessionEvent::Error(err));
                    return acker
                        .nack(BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        })
                        .await
                        .map_err(|_| Error::Nack);
                }
            }
        }
    }

    let effective = context.content_type.clone().or(content_type);
    let content = match decode_content(&data, effective.as_deref()) {
        Ok(content) => content,
        Err(err) => {
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            let _ = events.send(SessionEvent::Error(err));
            return acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
                .map_err(|_| Error::Nack);
        }
    };

    let message = SubscriberMessage {
        properties,
        data,
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        redelivered,
        queue: context.queue.clone(),
        namespace: context.namespace.clone(),
    };

    context.in_flight.fetch_add(1, Ordering::SeqCst);
    let acker = Acker::new(acker, context.in_flight.clone());
    if events
        .send(SessionEvent::Message {
            message,
            content,
            acker,
        })
        .is_err()
    {
        debug!("session receiver dropped, discarding delivery");
    }
    span.set_status(Status::Ok);
    Ok(())
}

/// Decodes a payload by content type: JSON for `application/json`, text for
/// `text/*`, raw bytes otherwise.
pub(crate) fn decode_content(data: &[u8], content_type: Option<&str>) -> Result<Content, Error> {
    match content_type {
        Some(content_type) if content_type.starts_with("application/json") => {
            serde_json::from_slice(data)
                .map(Content::Json)
                .map_err(|err| Error::Consume(format!("invalid JSON content: {err}")))
        }
        Some(content_type) if content_type.starts_with("text/") => {
            Ok(Content::Text(String::from_utf8_lossy(data).to_string()))
        }
        _ => Ok(Content::Buffer(data.to_vec())),
    }
}

fn option_flag(options: &Value, key: &str) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_json_content() {
        let content = decode_content(br#"{"answer":42}"#, Some("application/json")).unwrap();
        assert_eq!(content, Content::Json(json!({ "answer": 42 })));
    }

    #[test]
    fn decodes_text_content() {
        let content = decode_content(b"hello", Some("text/plain")).unwrap();
        assert_eq!(content, Content::Text("hello".to_string()));
    }

    #[test]
    fn unknown_content_types_stay_raw() {
        let content = decode_content(&[1, 2, 3], Some("application/octet-stream")).unwrap();
        assert_eq!(content, Content::Buffer(vec![1, 2, 3]));
        let content = decode_content(&[4, 5], None).unwrap();
        assert_eq!(content, Content::Buffer(vec![4, 5]));
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(decode_content(b"{nope", Some("application/json")).is_err());
    }
}
