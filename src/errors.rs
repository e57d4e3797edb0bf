// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by the configuration pipeline and
//! the broker runtime. Errors fall into three classes: configuration errors
//! (structural or semantic problems in the supplied topology, surfaced before
//! anything touches the network), operational errors (unknown entities,
//! encryption failures, channel errors raised by a specific verb), and
//! transport errors (connection level failures the vhost layer recovers from).
//! Every message identifies the offending entity by name.

use thiserror::Error;

/// Represents errors raised while configuring or operating the broker.
#[derive(Error, Debug)]
pub enum Error {
    /// The supplied configuration could not be merged or deserialized
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// One or more semantic rules failed during validation
    #[error("{0}")]
    Validation(String),

    /// The same publication name was declared by more than one vhost
    #[error("Duplicate publication: {0}")]
    DuplicatePublication(String),

    /// The same subscription name was declared by more than one vhost
    #[error("Duplicate subscription: {0}")]
    DuplicateSubscription(String),

    /// A verb referenced a vhost that is not part of the topology
    #[error("Unknown vhost: {0}")]
    UnknownVhost(String),

    /// A verb referenced a publication that is not part of the topology
    #[error("Unknown publication: {0}")]
    UnknownPublication(String),

    /// A verb referenced a subscription that is not part of the topology
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    /// A publication named a reply queue its vhost does not declare
    #[error("Publication: {publication} refers to an unknown reply queue: {queue}")]
    UnknownReplyQueue { publication: String, queue: String },

    /// A publication named an encryption profile the config does not declare
    #[error("Publication: {publication} refers to an unknown encryption profile: {profile}")]
    UnknownEncryptionProfile { publication: String, profile: String },

    /// The encryption key does not match the key size of the algorithm
    #[error("Invalid key length")]
    InvalidKeyLength,

    /// Error applying an encryption profile to an outgoing payload
    #[error("Failed to encrypt message using profile: {0}")]
    Encryption(String),

    /// Error reversing an encryption profile on an incoming payload
    #[error("Failed to decrypt message using profile: {0}")]
    Decryption(String),

    /// Error establishing a connection for the given vhost
    #[error("Failed to connect to vhost: {0}")]
    Connection(String),

    /// Error creating a channel on an established connection
    #[error("Failed to create a channel on vhost: {0}")]
    Channel(String),

    /// Error declaring an exchange with the given name
    #[error("Failed to declare exchange: {0}")]
    DeclareExchange(String),

    /// Error declaring a queue with the given name
    #[error("Failed to declare queue: {0}")]
    DeclareQueue(String),

    /// Error binding a destination to a source exchange
    #[error("Failed to bind: {destination} to: {src_name}")]
    Bind { src_name: String, destination: String },

    /// Error publishing through the named publication
    #[error("Failed to publish via publication: {0}")]
    Publish(String),

    /// Error purging the named queue
    #[error("Failed to purge queue: {0}")]
    Purge(String),

    /// Error deleting the named exchange or queue during nuke
    #[error("Failed to delete: {0}")]
    Delete(String),

    /// Error creating a consumer for the named subscription
    #[error("Failed to consume from subscription: {0}")]
    Consume(String),

    /// Error acknowledging a message
    #[error("Failed to ack message")]
    Ack,

    /// Error negative-acknowledging a message
    #[error("Failed to nack message")]
    Nack,

    /// A message was acked or nacked more than once
    #[error("Message already acknowledged or rejected")]
    AlreadyAcknowledged,

    /// A message exceeded the redelivery limit of its subscription
    #[error("Redeliveries exceeded for message: {0}")]
    RedeliveriesExceeded(String),

    /// A verb was called after the broker was shut down or nuked
    #[error("Broker has been shut down")]
    Shutdown,
}
