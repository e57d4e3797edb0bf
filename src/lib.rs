// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Warren
//!
//! A declarative layer on top of AMQP 0-9-1. Warren turns a nested
//! description of messaging topology (vhosts, exchanges, queues, bindings,
//! publications, subscriptions, shovels) into a running broker facade, so
//! applications publish and consume without managing channels, confirms,
//! redelivery, reconnection or encryption themselves.
//!
//! The configuration pipeline fills in defaults, qualifies names against
//! vhost namespaces, fans bindings out per key and validates the result
//! before anything touches the network. The broker then brings the topology
//! up leaf first and exposes a small verb surface: `publish`, `forward`,
//! `subscribe`, `unsubscribe_all`, `purge`, `nuke`, `shutdown`, `bounce`.

mod fields;
mod otel;
mod shovel;

pub mod broker;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod errors;
pub mod publication;
pub mod subscription;
pub mod vhost;

pub use broker::{Broker, Components};
pub use config::{configure, qualify, validate, BrokerConfig};
pub use errors::Error;
pub use publication::{Message, PublicationEvent, PublishOverrides, PublishReceipt};
pub use subscription::{
    Acker, Content, SessionEvent, SubscribeOverrides, SubscriberMessage, SubscriberSession,
};
