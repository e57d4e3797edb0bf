// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Broker Facade
//!
//! The process-wide controller. [`Broker::create`] runs the configuration
//! pipeline, then initializes the topology leaf first: counters, vhosts,
//! publications, subscriptions, shovels. The verbs on the resulting broker
//! are the whole public surface; topology maps are never mutated after
//! creation and sessions are tracked so teardown can cancel them in an
//! orderly way.
//!
//! Teardown reverses initialization: sessions cancel (with the channel close
//! deferral window), shovels stop, vhosts shut down. A keep-alive task holds
//! the process open until `shutdown` or `nuke` aborts it.

use crate::config::{
    configure, qualify, validate_with, BrokerConfig, SubscriptionConfig,
};
use crate::counter::{self, CounterFactory, RedeliveryCounter, StubCounter};
use crate::crypto::{AesCbcCipher, Cipher};
use crate::errors::Error;
use crate::publication::{Message, Publication, PublishOverrides, PublishReceipt};
use crate::shovel::{self, ShovelHandle};
use crate::subscription::{
    self, SessionControl, SubscribeOverrides, SubscriberMessage, SubscriberSession,
};
use crate::vhost::{ConnectionDetails, Vhost};
use lapin::Connection;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Caller-supplied component overrides: counter factories keyed by counter
/// type, and an alternative cipher provider.
#[derive(Default)]
pub struct Components {
    pub counters: HashMap<String, CounterFactory>,
    pub cipher: Option<Arc<dyn Cipher>>,
}

/// The live broker.
pub struct Broker {
    config: BrokerConfig,
    vhosts: BTreeMap<String, Arc<Vhost>>,
    publications: BTreeMap<String, Arc<Publication>>,
    subscriptions: BTreeMap<String, SubscriptionConfig>,
    counters: BTreeMap<String, Arc<dyn RedeliveryCounter>>,
    cipher: Arc<dyn Cipher>,
    sessions: Mutex<Vec<Arc<SessionControl>>>,
    shovels: Mutex<Vec<ShovelHandle>>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Broker {
    /// Configures, validates and initializes a broker from the supplied
    /// configuration tree.
    ///
    /// # Parameters
    /// * `config` - The user configuration, merged on top of the baseline
    ///
    /// # Returns
    /// * `Result<Arc<Broker>, Error>` - The live broker on success, or a
    ///   configuration/validation error before anything touched the network
    ///
    /// # Example
    /// ```ignore
    /// let broker = Broker::create(json!({ "vhosts": { "/": {} } })).await?;
    /// ```
    pub async fn create(config: Value) -> Result<Arc<Broker>, Error> {
        Self::create_with(config, Components::default()).await
    }

    /// As [`Broker::create`], with component overrides.
    ///
    /// # Parameters
    /// * `config` - The user configuration, merged on top of the baseline
    /// * `components` - Counter factories and cipher provider overrides
    ///
    /// # Returns
    /// * `Result<Arc<Broker>, Error>` - The live broker on success
    pub async fn create_with(config: Value, components: Components) -> Result<Arc<Broker>, Error> {
        let config = configure(config)?;
        let mut counter_types = counter::builtin_types();
        counter_types.extend(components.counters.keys().cloned());
        validate_with(&config, &counter_types)?;

        let counters = counter::build_counters(
            config
                .redeliveries
                .counters
                .iter()
                .map(|(name, counter)| (name.clone(), counter.clone())),
            &components.counters,
        )?;
        let cipher: Arc<dyn Cipher> = components
            .cipher
            .unwrap_or_else(|| Arc::new(AesCbcCipher));

        let mut vhosts = BTreeMap::new();
        for (name, vhost) in &config.vhosts {
            debug!("initialising vhost: {}", name);
            vhosts.insert(name.clone(), Vhost::init(vhost.clone()).await?);
        }

        let mut publications = BTreeMap::new();
        for (name, publication) in &config.publications {
            let vhost_name = publication.vhost.as_deref().unwrap_or("/");
            let vhost = vhosts
                .get(vhost_name)
                .cloned()
                .ok_or_else(|| Error::UnknownVhost(vhost_name.to_string()))?;
            publications.insert(
                name.clone(),
                Arc::new(Publication::new(publication.clone(), vhost, cipher.clone())),
            );
        }

        let subscriptions = config.subscriptions.clone();

        let broker = Arc::new(Broker {
            vhosts,
            publications,
            subscriptions,
            counters,
            cipher,
            sessions: Mutex::new(Vec::new()),
            shovels: Mutex::new(Vec::new()),
            keep_alive: Mutex::new(Some(tokio::spawn(std::future::pending::<()>()))),
            closed: AtomicBool::new(false),
            config,
        });
        broker.start_shovels().await?;
        Ok(broker)
    }

    /// The fully resolved configuration this broker runs.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The live underlying connection for the named vhost, reconnecting
    /// first if it was lost.
    ///
    /// # Parameters
    /// * `vhost` - Name of the vhost
    ///
    /// # Returns
    /// * `Result<Arc<Connection>, Error>` - The connection handle, or an
    ///   error naming the unknown vhost
    pub async fn connect(&self, vhost: &str) -> Result<Arc<Connection>, Error> {
        self.ensure_running()?;
        self.vhost(vhost)?.connection().await
    }

    /// Publishes a message through the named publication.
    ///
    /// # Parameters
    /// * `name` - Name of the publication
    /// * `message` - The payload; text, structured or raw bytes
    /// * `overrides` - Per-publish overrides, or a bare routing key
    ///
    /// # Returns
    /// * `Result<PublishReceipt, Error>` - A receipt whose events report the
    ///   outcome, or an error naming the unknown publication
    pub async fn publish(
        &self,
        name: &str,
        message: impl Into<Message>,
        overrides: impl Into<PublishOverrides>,
    ) -> Result<PublishReceipt, Error> {
        self.ensure_running()?;
        self.publication(name)?
            .publish(&message.into(), &overrides.into())
            .await
    }

    /// Re-publishes an inbound message through the named publication,
    /// recording its origin in the message headers.
    ///
    /// # Parameters
    /// * `name` - Name of the publication to forward through
    /// * `message` - The message as delivered to a subscriber session
    /// * `overrides` - Per-publish overrides, or a bare routing key
    ///
    /// # Returns
    /// * `Result<PublishReceipt, Error>` - A receipt whose events report the
    ///   outcome; the receipt carries the original message id
    pub async fn forward(
        &self,
        name: &str,
        message: &SubscriberMessage,
        overrides: impl Into<PublishOverrides>,
    ) -> Result<PublishReceipt, Error> {
        self.ensure_running()?;
        self.publication(name)?
            .forward(message, &overrides.into())
            .await
    }

    /// Creates a session consuming from the named subscription.
    ///
    /// # Parameters
    /// * `name` - Name of the subscription
    /// * `overrides` - Per-subscribe overrides; pass the default when none
    ///   are needed
    ///
    /// # Returns
    /// * `Result<SubscriberSession, Error>` - The live session, or an error
    ///   naming the unknown subscription
    pub async fn subscribe(
        &self,
        name: &str,
        overrides: SubscribeOverrides,
    ) -> Result<SubscriberSession, Error> {
        self.ensure_running()?;
        let config = self
            .subscriptions
            .get(name)
            .ok_or_else(|| Error::UnknownSubscription(name.to_string()))?;
        let vhost = self.vhost(config.vhost.as_deref().unwrap_or("/"))?;

        let counter_name = config
            .redeliveries
            .as_ref()
            .and_then(|redeliveries| redeliveries.counter.clone())
            .unwrap_or_else(|| "stub".to_string());
        let counter = self
            .counters
            .get(&counter_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(StubCounter));

        let session =
            subscription::subscribe(config, vhost, counter, self.cipher.clone(), &overrides)
                .await?;
        self.sessions
            .lock()
            .expect("sessions")
            .push(session.control.clone());
        Ok(session)
    }

    /// Subscribes to every subscription matching the filter.
    ///
    /// # Parameters
    /// * `filter` - Predicate over subscription configs; `None` selects
    ///   everything except auto-created subscriptions
    ///
    /// # Returns
    /// * `Result<Vec<SubscriberSession>, Error>` - One session per matching
    ///   subscription, or the first underlying subscribe failure
    pub async fn subscribe_all(
        &self,
        filter: Option<&(dyn Fn(&SubscriptionConfig) -> bool + Sync)>,
    ) -> Result<Vec<SubscriberSession>, Error> {
        let names: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, config)| match filter {
                Some(filter) => filter(config),
                None => !config.is_auto_created(),
            })
            .map(|(name, _)| name.clone())
            .collect();

        let mut sessions = Vec::with_capacity(names.len());
        for name in names {
            sessions.push(self.subscribe(&name, SubscribeOverrides::default()).await?);
        }
        Ok(sessions)
    }

    /// Cancels every active session, then waits out the longest outstanding
    /// channel close deferral so in-flight closes can complete.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once every session has cancelled and the
    ///   deferral window has passed
    pub async fn unsubscribe_all(&self) -> Result<(), Error> {
        let snapshot: Vec<Arc<SessionControl>> = {
            let mut sessions = self.sessions.lock().expect("sessions");
            sessions.drain(..).collect()
        };

        let mut max_defer = Duration::ZERO;
        for control in snapshot {
            if let Err(err) = control.cancel().await {
                error!(error = err.to_string(), "error cancelling session");
            }
            max_defer = max_defer.max(control.defer_close_remaining());
        }
        if !max_defer.is_zero() {
            tokio::time::sleep(max_defer).await;
        }
        Ok(())
    }

    /// Purges every queue on every vhost.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once every queue has been purged
    pub async fn purge(&self) -> Result<(), Error> {
        self.ensure_running()?;
        for vhost in self.vhosts.values() {
            vhost.purge_all().await?;
        }
        Ok(())
    }

    /// Tears the topology down: cancels sessions, stops shovels, deletes
    /// queues and exchanges, closes connections and clears broker state.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once every vhost is torn down; the broker
    ///   is unusable afterwards
    pub async fn nuke(&self) -> Result<(), Error> {
        debug!("nuking broker");
        self.unsubscribe_all().await?;
        self.stop_shovels();
        for vhost in self.vhosts.values() {
            vhost.nuke().await?;
        }
        self.clear_keep_alive();
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Graceful stop: cancels sessions, stops shovels and shuts the vhosts
    /// down. Clears the keep-alive task so the process can exit.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once every vhost connection has closed
    pub async fn shutdown(&self) -> Result<(), Error> {
        debug!("shutting down broker");
        self.unsubscribe_all().await?;
        self.stop_shovels();
        for vhost in self.vhosts.values() {
            vhost.shutdown().await?;
        }
        self.clear_keep_alive();
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cancels sessions, bounces every vhost (close and reconnect) and
    /// restarts the shovels.
    ///
    /// # Returns
    /// * `Result<(), Error>` - Ok once every vhost is connected again
    pub async fn bounce(self: &Arc<Self>) -> Result<(), Error> {
        self.ensure_running()?;
        self.unsubscribe_all().await?;
        self.stop_shovels();
        for vhost in self.vhosts.values() {
            vhost.bounce().await?;
        }
        self.start_shovels().await
    }

    /// Snapshot of the active connection per vhost.
    ///
    /// # Returns
    /// A vector with one entry per vhost that currently holds a connection,
    /// carrying its loggable URL
    pub async fn get_connections(&self) -> Vec<ConnectionDetails> {
        let mut details = Vec::new();
        for vhost in self.vhosts.values() {
            if let Some(connection) = vhost.connection_details().await {
                details.push(connection);
            }
        }
        details
    }

    /// Qualifies a name against the named vhost's namespace.
    ///
    /// # Parameters
    /// * `vhost` - Name of the vhost whose namespace applies
    /// * `name` - The logical entity name
    ///
    /// # Returns
    /// * `Result<String, Error>` - The name as used on the wire, or an error
    ///   naming the unknown vhost
    pub fn get_fully_qualified_name(&self, vhost: &str, name: &str) -> Result<String, Error> {
        let vhost = self.vhost(vhost)?;
        Ok(qualify(name, vhost.namespace(), None))
    }

    fn vhost(&self, name: &str) -> Result<Arc<Vhost>, Error> {
        self.vhosts
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownVhost(name.to_string()))
    }

    fn publication(&self, name: &str) -> Result<Arc<Publication>, Error> {
        self.publications
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPublication(name.to_string()))
    }

    async fn start_shovels(self: &Arc<Self>) -> Result<(), Error> {
        let shovels: Vec<_> = self
            .config
            .shovels
            .iter()
            .map(|(name, shovel)| (name.clone(), shovel.clone()))
            .collect();
        for (name, shovel) in shovels {
            let subscription = shovel
                .subscription
                .clone()
                .ok_or_else(|| Error::UnknownSubscription(name.clone()))?;
            let publication_name = shovel
                .publication
                .clone()
                .ok_or_else(|| Error::UnknownPublication(name.clone()))?;

            debug!("starting shovel: {}", name);
            let session = self
                .subscribe(&subscription, SubscribeOverrides::default())
                .await?;
            let publication = self.publication(&publication_name)?;
            let handle = shovel::start(name, session, publication);
            self.shovels.lock().expect("shovels").push(handle);
        }
        Ok(())
    }

    fn stop_shovels(&self) {
        let handles: Vec<ShovelHandle> = {
            let mut shovels = self.shovels.lock().expect("shovels");
            shovels.drain(..).collect()
        };
        for handle in handles {
            handle.stop();
        }
    }

    fn clear_keep_alive(&self) {
        if let Some(task) = self.keep_alive.lock().expect("keep alive").take() {
            task.abort();
        }
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}
