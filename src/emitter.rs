//! Outbound-only publishing: broadcasts and confirmed queue sends.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::EmitterConfig;
use crate::envelope::{Envelope, Payload};
use crate::error::{Error, Result};
use crate::lifecycle::BrokerAdmin;
use crate::transport::{Confirmation, Connection, MessageProperties, ScopedChannel, DEFAULT_EXCHANGE};
use crate::validation::{broadcast_exchange_name, validate_actor_id, validate_queue_name};

/// Publishes on behalf of one actor. Every call uses its own channel.
pub struct Emitter {
    actor_id: String,
    connection: Arc<dyn Connection>,
    confirm_timeout: Duration,
}

impl Emitter {
    pub fn new(actor_id: &str, connection: Arc<dyn Connection>) -> Result<Self> {
        validate_actor_id(actor_id)?;
        if !connection.is_open() {
            return Err(Error::InvalidArgument("connection is closed".to_string()));
        }
        Ok(Self {
            actor_id: actor_id.to_string(),
            connection,
            confirm_timeout: EmitterConfig::default().confirm_timeout(),
        })
    }

    /// Create an emitter with settings from configuration.
    pub fn with_config(
        actor_id: &str,
        connection: Arc<dyn Connection>,
        config: &EmitterConfig,
    ) -> Result<Self> {
        Ok(Self::new(actor_id, connection)?.with_confirm_timeout(config.confirm_timeout()))
    }

    /// Bound on waiting for the broker's verdict in [`Emitter::enqueue`].
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Publish to this actor's fanout exchange. Best effort, no confirmation.
    pub async fn broadcast<T: Payload>(&self, payload: &T) -> Result<()> {
        let body = Envelope::encode(payload)?;
        let exchange = broadcast_exchange_name(&self.actor_id);

        let channel = ScopedChannel::open(self.connection.as_ref())
            .await
            .map_err(sending)?;
        let result = async {
            channel.exchange_declare_fanout(&exchange).await?;
            channel
                .publish(&exchange, "", &body, MessageProperties::json(), false)
                .await
        }
        .await;
        channel.close().await;

        result.map_err(sending)?;
        debug!(actor_id = %self.actor_id, exchange = %exchange, "Broadcast published");
        Ok(())
    }

    /// Send to a named queue and wait for the broker's verdict.
    ///
    /// Resolves to exactly one of: `Ok` (ack), `MessageNack` (e.g. queue full
    /// under reject-publish), `MessageRouting` (no such queue), `Sending`
    /// (publish failed or no verdict within the confirm timeout).
    pub async fn enqueue<T: Payload>(&self, queue: &str, payload: &T) -> Result<()> {
        validate_queue_name(queue)?;
        let body = Envelope::encode(payload)?;

        let channel = ScopedChannel::open(self.connection.as_ref())
            .await
            .map_err(sending)?;
        let outcome = async {
            channel.confirm_select().await.map_err(sending)?;
            let publish =
                channel.publish(DEFAULT_EXCHANGE, queue, &body, MessageProperties::json(), true);
            match tokio::time::timeout(self.confirm_timeout, publish).await {
                Ok(Ok(Confirmation::Ack)) => Ok(()),
                Ok(Ok(Confirmation::Nack)) => Err(Error::MessageNack),
                Ok(Ok(Confirmation::Returned { reply_text })) => Err(Error::MessageRouting(
                    format!("queue '{}': {}", queue, reply_text),
                )),
                Ok(Ok(Confirmation::NotRequested)) => Err(Error::Sending(
                    "channel is not in confirm mode".to_string(),
                )),
                Ok(Err(e)) => Err(sending(e)),
                Err(_) => Err(Error::Sending(format!(
                    "no confirmation within {:?}",
                    self.confirm_timeout
                ))),
            }
        }
        .await;
        channel.close().await;

        match &outcome {
            Ok(()) => debug!(actor_id = %self.actor_id, queue = %queue, "Message enqueued"),
            Err(e) => warn!(actor_id = %self.actor_id, queue = %queue, error = %e, "Enqueue failed"),
        }
        outcome
    }
}

impl BrokerAdmin for Emitter {
    fn admin_connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }
}

fn sending(e: Error) -> Error {
    match e {
        Error::Sending(_) => e,
        other => Error::Sending(other.to_string()),
    }
}
