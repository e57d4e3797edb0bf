// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Shovels
//!
//! A shovel bridges a subscription to a publication: every message consumed
//! from the subscription is forwarded through the publication and acked once
//! the broker has confirmed the forward. Messages whose forward fails are
//! rejected without requeue so a broken downstream cannot wedge the source
//! queue.

use crate::publication::{PublicationEvent, Publication, PublishOverrides};
use crate::subscription::{SessionEvent, SubscriberSession};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) struct ShovelHandle {
    name: String,
    task: JoinHandle<()>,
}

impl ShovelHandle {
    pub(crate) fn stop(&self) {
        debug!("stopping shovel: {}", self.name);
        self.task.abort();
    }
}

/// Spawns the bridge loop for one shovel.
pub(crate) fn start(
    name: String,
    mut session: SubscriberSession,
    publication: Arc<Publication>,
) -> ShovelHandle {
    let shovel = name.clone();
    let task = tokio::spawn(async move {
        while let Some(event) = session.next().await {
            match event {
                SessionEvent::Message { message, acker, .. } => {
                    match publication
                        .forward(&message, &PublishOverrides::default())
                        .await
                    {
                        Ok(mut receipt) => {
                            let forwarded = loop {
                                match receipt.next().await {
                                    Some(PublicationEvent::Success { .. }) => break true,
                                    Some(PublicationEvent::Returned(_)) => continue,
                                    Some(PublicationEvent::Error { error, .. }) => {
                                        error!(
                                            error = error.to_string(),
                                            shovel, "error forwarding message"
                                        );
                                        break false;
                                    }
                                    None => break false,
                                }
                            };
                            let settled = if forwarded {
                                acker.ack().await
                            } else {
                                acker.nack(false).await
                            };
                            if let Err(err) = settled {
                                error!(error = err.to_string(), shovel, "error settling message");
                            }
                        }
                        Err(err) => {
                            error!(error = err.to_string(), shovel, "error forwarding message");
                            if let Err(err) = acker.nack(false).await {
                                error!(error = err.to_string(), shovel, "error settling message");
                            }
                        }
                    }
                }
                SessionEvent::Error(err) => {
                    warn!(error = err.to_string(), shovel, "shovel consumer error");
                }
                SessionEvent::Cancelled => break,
            }
        }
        debug!("shovel finished: {}", shovel);
    });

    ShovelHandle { name, task }
}
