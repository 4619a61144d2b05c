//! NATS transport for coordination traffic.
//!
//! Every topic lives under one subject prefix (`traffic` by default), e.g.
//! `traffic.green_request`. A node subscribes to `<prefix>.>` and routes by
//! subject; publishing encodes an [`Outbound`] with the wire codec and sends
//! it on the topic's subject.

use crossway_types::Outbound;
use crossway_types::wire;
use futures::StreamExt as _;
use tracing::{debug, info};

use crate::driver::{Incoming, Publisher};
use crate::error::NodeError;

/// NATS client wrapper bound to one subject prefix.
pub struct NatsBus {
    client: async_nats::Client,
    prefix: String,
}

impl NatsBus {
    /// Connect to a NATS server.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Nats`] if the connection cannot be established.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, NodeError> {
        info!(url = url, "connecting to NATS server");
        let client = async_nats::connect(url).await.map_err(|e| NodeError::Nats {
            message: format!("failed to connect to {url}: {e}"),
        })?;
        info!("NATS connection established");
        Ok(Self {
            client,
            prefix: prefix.to_owned(),
        })
    }

    /// Subject prefix shared by every topic.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subscribe to every subject under the prefix.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Nats`] if the subscription fails.
    pub async fn subscribe(&self) -> Result<impl futures::Stream<Item = Incoming> + Unpin, NodeError> {
        let subject = format!("{}.>", self.prefix);
        debug!(subject = subject, "subscribing");
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| NodeError::Nats {
                message: format!("failed to subscribe to {subject}: {e}"),
            })?;
        info!(subject = subject, "subscribed to coordination subjects");
        Ok(subscriber.map(|message| Incoming {
            subject: message.subject.to_string(),
            payload: message.payload.to_vec(),
        }))
    }
}

impl Publisher for NatsBus {
    async fn publish(&self, message: &Outbound) -> Result<(), NodeError> {
        let (topic, payload) = wire::encode(message)?;
        let subject = topic.subject(&self.prefix);
        debug!(subject = subject, bytes = payload.len(), "publishing");
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| NodeError::Nats {
                message: format!("failed to publish to {subject}: {e}"),
            })
    }
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
