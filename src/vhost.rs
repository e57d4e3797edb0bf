// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Vhost Runtime
//!
//! A [`Vhost`] owns the live connection for one virtual host and asserts the
//! topology described by its resolved configuration: exchanges, queues and
//! bindings, honoring the `assert`/`check` split (declare vs. passive
//! declare) and per-queue purge-on-start. Connections are attempted in the
//! failover order the configurator produced; reconnection backs off according
//! to the connection retry settings.
//!
//! Publications borrow pooled channels from their vhost; subscriber sessions
//! get a dedicated channel each.

use crate::config::{ConnectionConfig, DestinationType, VhostConfig};
use crate::errors::Error;
use crate::fields::to_field_table;
use lapin::options::{
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::LongString;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const CONNECT_ROUNDS: u32 = 3;

/// Snapshot of the active connection for one vhost.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub vhost: String,
    /// The loggable URL of the connection currently in use.
    pub connection_url: String,
}

/// A live virtual host.
pub struct Vhost {
    config: VhostConfig,
    state: Mutex<VhostState>,
}

#[derive(Default)]
struct VhostState {
    connection: Option<Arc<Connection>>,
    active_url: Option<String>,
    regular: Vec<Arc<Channel>>,
    confirm: Vec<Arc<Channel>>,
    next_regular: usize,
    next_confirm: usize,
}

impl Vhost {
    /// Connects the vhost and asserts its topology.
    pub(crate) async fn init(config: VhostConfig) -> Result<Arc<Vhost>, Error> {
        let vhost = Arc::new(Vhost {
            config,
            state: Mutex::new(VhostState::default()),
        });
        let mut state = vhost.state.lock().await;
        vhost.establish(&mut state).await?;
        drop(state);
        Ok(vhost)
    }

    pub(crate) fn config(&self) -> &VhostConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.config.namespace()
    }

    /// The live underlying connection, reconnecting first if it was lost.
    pub(crate) async fn connection(&self) -> Result<Arc<Connection>, Error> {
        let mut state = self.state.lock().await;
        self.ensure_connected(&mut state).await?;
        state
            .connection
            .clone()
            .ok_or_else(|| Error::Connection(self.config.name.clone()))
    }

    pub(crate) async fn connection_details(&self) -> Option<ConnectionDetails> {
        let state = self.state.lock().await;
        state.active_url.clone().map(|url| ConnectionDetails {
            vhost: self.config.name.clone(),
            connection_url: url,
        })
    }

    /// A pooled channel for publishing. Broken channels are replaced on the
    /// way out.
    pub(crate) async fn publish_channel(&self, confirm: bool) -> Result<Arc<Channel>, Error> {
        let mut guard = self.state.lock().await;
        self.ensure_connected(&mut guard).await?;
        let state = &mut *guard;

        let pools = self
            .config
            .publication_channel_pools
            .clone()
            .unwrap_or_default();
        let size = if confirm {
            pools.confirm_pool_size.unwrap_or(1).max(1)
        } else {
            pools.regular_pool_size.unwrap_or(1).max(1)
        };
        let connection = state
            .connection
            .clone()
            .ok_or_else(|| Error::Connection(self.config.name.clone()))?;
        let channels = if confirm {
            &mut state.confirm
        } else {
            &mut state.regular
        };
        channels.retain(|channel| channel.status().connected());

        if channels.len() < size {
            let channel = self.create_channel_on(&connection).await?;
            if confirm {
                channel
                    .confirm_select(lapin::options::ConfirmSelectOptions::default())
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error enabling confirms");
                        Error::Channel(self.config.name.clone())
                    })?;
            }
            let channel = Arc::new(channel);
            channels.push(channel.clone());
            return Ok(channel);
        }

        let cursor = if confirm {
            &mut state.next_confirm
        } else {
            &mut state.next_regular
        };
        let index = *cursor % channels.len();
        *cursor = cursor.wrapping_add(1);
        Ok(channels[index].clone())
    }

    /// A dedicated channel, owned by the caller. Used by subscriber sessions.
    pub(crate) async fn create_channel(&self) -> Result<Channel, Error> {
        let connection = self.connection().await?;
        self.create_channel_on(&connection).await
    }

    async fn create_channel_on(&self, connection: &Connection) -> Result<Channel, Error> {
        debug!("creating channel on vhost: {}", self.config.name);
        connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error creating channel");
            Error::Channel(self.config.name.clone())
        })
    }

    /// Purges every queue owned by this vhost.
    pub(crate) async fn purge_all(&self) -> Result<(), Error> {
        let channel = self.create_channel().await?;
        for (name, queue) in self.config.queues.iter() {
            let fqn = queue.fully_qualified_name.as_deref().unwrap_or(name);
            debug!("purging queue: {}", fqn);
            channel
                .queue_purge(fqn, QueuePurgeOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error purging queue");
                    Error::Purge(fqn.to_string())
                })?;
        }
        Ok(())
    }

    /// Deletes every queue and exchange owned by this vhost, then closes the
    /// connection.
    pub(crate) async fn nuke(&self) -> Result<(), Error> {
        let channel = self.create_channel().await?;
        for (name, queue) in self.config.queues.iter() {
            let fqn = queue.fully_qualified_name.as_deref().unwrap_or(name);
            debug!("deleting queue: {}", fqn);
            channel
                .queue_delete(fqn, QueueDeleteOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error deleting queue");
                    Error::Delete(fqn.to_string())
                })?;
        }
        for (name, exchange) in self.config.exchanges.iter() {
            if name.is_empty() {
                continue;
            }
            let fqn = exchange.fully_qualified_name.as_deref().unwrap_or(name);
            debug!("deleting exchange: {}", fqn);
            channel
                .exchange_delete(fqn, ExchangeDeleteOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error deleting exchange");
                    Error::Delete(fqn.to_string())
                })?;
        }
        self.shutdown().await
    }

    /// Closes the connection and forgets all pooled channels.
    pub(crate) async fn shutdown(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.regular.clear();
        state.confirm.clear();
        state.active_url = None;
        if let Some(connection) = state.connection.take() {
            if let Err(err) = connection.close(200, "Goodbye").await {
                warn!(error = err.to_string(), "error closing connection");
            }
        }
        Ok(())
    }

    /// Closes the connection and establishes a fresh one.
    pub(crate) async fn bounce(&self) -> Result<(), Error> {
        self.shutdown().await?;
        let mut state = self.state.lock().await;
        self.establish(&mut state).await
    }

    async fn ensure_connected(&self, state: &mut VhostState) -> Result<(), Error> {
        let connected = state
            .connection
            .as_ref()
            .map(|connection| connection.status().connected())
            .unwrap_or(false);
        if connected {
            return Ok(());
        }
        state.regular.clear();
        state.confirm.clear();
        self.establish(state).await
    }

    /// Connects using the failover-ordered connection list and asserts the
    /// topology. Rounds back off according to the retry settings.
    async fn establish(&self, state: &mut VhostState) -> Result<(), Error> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(Error::Connection(self.config.name.clone()));
        }

        let mut backoff = self.retry_backoff();
        for round in 0..CONNECT_ROUNDS {
            for candidate in &candidates {
                let Some(url) = candidate.url.as_deref() else {
                    continue;
                };
                let loggable = candidate.loggable_url.clone().unwrap_or_default();
                debug!("connecting to: {}", loggable);

                let properties = ConnectionProperties::default()
                    .with_connection_name(LongString::from(self.config.name.clone()));
                match Connection::connect(url, properties).await {
                    Ok(connection) => {
                        debug!("connected to: {}", loggable);
                        let connection = Arc::new(connection);
                        self.assert_topology(&connection).await?;
                        state.connection = Some(connection);
                        state.active_url = Some(loggable);
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            url = loggable,
                            "failure to connect"
                        );
                    }
                }
            }
            if round + 1 < CONNECT_ROUNDS {
                tokio::time::sleep(backoff).await;
                backoff = self.next_backoff(backoff);
            }
        }

        error!("no connection candidate accepted for vhost: {}", self.config.name);
        Err(Error::Connection(self.config.name.clone()))
    }

    fn candidates(&self) -> Vec<ConnectionConfig> {
        self.config
            .connections
            .iter()
            .filter_map(|spec| spec.as_config().cloned())
            .collect()
    }

    fn retry_backoff(&self) -> Duration {
        let min = self
            .candidates()
            .first()
            .and_then(|connection| connection.retry.as_ref())
            .and_then(|retry| retry.min)
            .unwrap_or(1000);
        Duration::from_millis(min)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let retry = self
            .candidates()
            .first()
            .and_then(|connection| connection.retry.clone())
            .unwrap_or_default();
        let factor = retry.factor.unwrap_or(2.0);
        let max = Duration::from_millis(retry.max.unwrap_or(60000));
        current.mul_f64(factor).min(max)
    }

    /// Declares exchanges and queues, purges queues marked for it, then sets
    /// up the bindings.
    async fn assert_topology(&self, connection: &Connection) -> Result<(), Error> {
        let channel = self.create_channel_on(connection).await?;
        self.assert_exchanges(&channel).await?;
        self.assert_queues(&channel).await?;
        self.assert_bindings(&channel).await?;
        Ok(())
    }

    async fn assert_exchanges(&self, channel: &Channel) -> Result<(), Error> {
        for (name, exchange) in self.config.exchanges.iter() {
            if name.is_empty() {
                continue;
            }
            let fqn = exchange.fully_qualified_name.as_deref().unwrap_or(name);
            let passive = exchange.check.unwrap_or(false) && !exchange.assert.unwrap_or(false);
            if !exchange.assert.unwrap_or(false) && !exchange.check.unwrap_or(false) {
                continue;
            }
            debug!("creating exchange: {}", fqn);

            let kind = exchange_kind(exchange.kind.as_deref().unwrap_or("topic"));
            let options = exchange.options.clone();
            if let Err(err) = channel
                .exchange_declare(
                    fqn,
                    kind,
                    ExchangeDeclareOptions {
                        passive,
                        durable: option_flag(&options, "durable"),
                        auto_delete: option_flag(&options, "autoDelete"),
                        internal: option_flag(&options, "internal"),
                        nowait: false,
                    },
                    to_field_table(options.get("arguments").unwrap_or(&Value::Null)),
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    name = fqn,
                    "error to declare the exchange"
                );
                return Err(Error::DeclareExchange(fqn.to_string()));
            }

            debug!("exchange: {} was created", fqn);
        }
        Ok(())
    }

    async fn assert_queues(&self, channel: &Channel) -> Result<(), Error> {
        for (name, queue) in self.config.queues.iter() {
            let fqn = queue.fully_qualified_name.as_deref().unwrap_or(name);
            let passive = queue.check.unwrap_or(false) && !queue.assert.unwrap_or(false);
            if queue.assert.unwrap_or(false) || queue.check.unwrap_or(false) {
                debug!("creating queue: {}", fqn);

                let options = queue.options.clone();
                if let Err(err) = channel
                    .queue_declare(
                        fqn,
                        QueueDeclareOptions {
                            passive,
                            durable: option_flag(&options, "durable"),
                            exclusive: option_flag(&options, "exclusive"),
                            auto_delete: option_flag(&options, "autoDelete"),
                            nowait: false,
                        },
                        to_field_table(options.get("arguments").unwrap_or(&Value::Null)),
                    )
                    .await
                {
                    error!(error = err.to_string(), "error to declare the queue");
                    return Err(Error::DeclareQueue(fqn.to_string()));
                }

                debug!("queue: {} was created", fqn);
            }

            if queue.purge.unwrap_or(false) {
                debug!("purging queue: {}", fqn);
                channel
                    .queue_purge(fqn, QueuePurgeOptions::default())
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error purging queue");
                        Error::Purge(fqn.to_string())
                    })?;
            }
        }
        Ok(())
    }

    async fn assert_bindings(&self, channel: &Channel) -> Result<(), Error> {
        for (name, binding) in self.config.bindings.iter() {
            let source = binding.source.as_deref().unwrap_or_default();
            let destination = binding.destination.as_deref().unwrap_or_default();
            let binding_key = binding.binding_key.as_deref().unwrap_or("#");

            let bind_error = || Error::Bind {
                src_name: source.to_string(),
                destination: destination.to_string(),
            };
            let source_fqn = self
                .config
                .exchange(source)
                .and_then(|exchange| exchange.fully_qualified_name.clone())
                .ok_or_else(bind_error)?;

            debug!(
                "binding: {} to the exchange: {} with the key: {}",
                destination, source, binding_key
            );

            match binding.destination_type.unwrap_or(DestinationType::Queue) {
                DestinationType::Queue => {
                    let destination_fqn = self
                        .config
                        .queue(destination)
                        .and_then(|queue| queue.fully_qualified_name.clone())
                        .ok_or_else(bind_error)?;
                    channel
                        .queue_bind(
                            &destination_fqn,
                            &source_fqn,
                            binding_key,
                            QueueBindOptions::default(),
                            to_field_table(
                                binding.options.get("arguments").unwrap_or(&Value::Null),
                            ),
                        )
                        .await
                        .map_err(|err| {
                            error!(error = err.to_string(), "error to bind queue to exchange");
                            bind_error()
                        })?;
                }
                DestinationType::Exchange => {
                    let destination_fqn = self
                        .config
                        .exchange(destination)
                        .and_then(|exchange| exchange.fully_qualified_name.clone())
                        .ok_or_else(bind_error)?;
                    channel
                        .exchange_bind(
                            &destination_fqn,
                            &source_fqn,
                            binding_key,
                            lapin::options::ExchangeBindOptions::default(),
                            to_field_table(
                                binding.options.get("arguments").unwrap_or(&Value::Null),
                            ),
                        )
                        .await
                        .map_err(|err| {
                            error!(
                                error = err.to_string(),
                                "error to bind exchange to exchange"
                            );
                            bind_error()
                        })?;
                }
            }

            debug!("binding: {} was created", name);
        }
        Ok(())
    }
}

fn option_flag(options: &Value, key: &str) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_exchange_kinds() {
        assert_eq!(exchange_kind("direct"), ExchangeKind::Direct);
        assert_eq!(exchange_kind("topic"), ExchangeKind::Topic);
        assert_eq!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_string())
        );
    }

    #[test]
    fn reads_option_flags() {
        let options = serde_json::json!({ "durable": true });
        assert!(option_flag(&options, "durable"));
        assert!(!option_flag(&options, "exclusive"));
    }
}
