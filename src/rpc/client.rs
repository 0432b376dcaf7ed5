//! RPC caller.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::outcome::RpcOutcome;
use super::pending::PendingCalls;
use crate::config::{effective_timeout_secs, RpcConfig};
use crate::envelope::{Envelope, Payload};
use crate::error::{Error, Result};
use crate::transport::{
    Connection, Consumer, MessageProperties, QueueOptions, ScopedChannel, DEFAULT_EXCHANGE,
};
use crate::validation::{rpc_queue_name, validate_actor_id, validate_entity_name};

/// Removes a call from the table when the caller stops waiting for any reason.
struct PendingGuard<'a> {
    table: &'a PendingCalls,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.take(self.correlation_id);
    }
}

enum Race {
    Cancelled,
    Reply(Vec<u8>),
    ReplyLost,
    TimedOut,
}

/// Issues correlated requests to [`RpcHandler`](super::RpcHandler)s.
///
/// Each call opens its own channel and private reply queue, so calls never
/// share reply state and the client stays usable after any failure.
pub struct RpcClient {
    connection: Arc<dyn Connection>,
    default_timeout: Duration,
    pending: Arc<PendingCalls>,
}

impl RpcClient {
    pub fn new(connection: Arc<dyn Connection>) -> Result<Self> {
        if !connection.is_open() {
            return Err(Error::InvalidArgument("connection is closed".to_string()));
        }
        Ok(Self {
            connection,
            default_timeout: RpcConfig::default().default_timeout(),
            pending: Arc::new(PendingCalls::new()),
        })
    }

    pub fn with_config(connection: Arc<dyn Connection>, config: &RpcConfig) -> Result<Self> {
        let mut client = Self::new(connection)?;
        client.default_timeout = config.default_timeout();
        Ok(client)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Set the timeout used when a call passes none. `<= 0` means 15 s.
    pub fn set_default_timeout(&mut self, secs: i64) {
        self.default_timeout = effective_timeout_secs(secs);
    }

    /// Calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Call with the default timeout and no cancellation.
    pub async fn call<Req, Resp>(&self, actor_id: &str, request: &Req) -> Result<Resp>
    where
        Req: Payload,
        Resp: Payload,
    {
        self.call_with_options(actor_id, request, 0, CancellationToken::new())
            .await
    }

    /// Send `request` to `actor_id`'s handler and await the reply.
    ///
    /// `timeout_secs <= 0` uses the default timeout. Cancellation only ends
    /// the wait; a request already delivered may still be executed.
    pub async fn call_with_options<Req, Resp>(
        &self,
        actor_id: &str,
        request: &Req,
        timeout_secs: i64,
        cancel: CancellationToken,
    ) -> Result<Resp>
    where
        Req: Payload,
        Resp: Payload,
    {
        validate_actor_id(actor_id)?;
        let queue = rpc_queue_name(actor_id, Req::type_tag());
        validate_entity_name(&queue)?;
        request
            .validate()
            .map_err(|e| Error::InvalidArgument(format!("invalid request: {}", e)))?;
        let body = Envelope::encode(request)?;

        let timeout = if timeout_secs > 0 {
            effective_timeout_secs(timeout_secs)
        } else {
            self.default_timeout
        };

        let channel = ScopedChannel::open(self.connection.as_ref())
            .await
            .map_err(sending)?;
        let result = self
            .exchange::<Resp>(&channel, &queue, &body, timeout, &cancel)
            .await;
        channel.close().await;
        result
    }

    async fn exchange<Resp: Payload>(
        &self,
        channel: &ScopedChannel,
        queue: &str,
        body: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resp> {
        let reply_queue = channel
            .queue_declare("", QueueOptions::private())
            .await
            .map_err(sending)?;
        let consumer = channel
            .consume(&reply_queue.name, true)
            .await
            .map_err(sending)?;

        let correlation_id = Uuid::new_v4().to_string();
        let reply = self.pending.insert(&correlation_id);
        let _guard = PendingGuard {
            table: &self.pending,
            correlation_id: &correlation_id,
        };
        let listener = ReplyListener::spawn(consumer, Arc::clone(&self.pending), &correlation_id);

        let properties = MessageProperties::json()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_queue.name.as_str())
            .with_expiration(timeout);
        channel
            .publish(DEFAULT_EXCHANGE, queue, body, properties, false)
            .await
            .map_err(sending)?;
        debug!(queue = %queue, correlation_id = %correlation_id, timeout = ?timeout, "RPC request published");

        let race = race(reply, timeout, cancel).await;
        drop(listener);

        // A cancellation wins even when a reply or the timer was ready too.
        if cancel.is_cancelled() {
            debug!(correlation_id = %correlation_id, "RPC call cancelled");
            return Err(Error::Cancelled);
        }
        match race {
            Race::Reply(body) => decode_reply(&body),
            Race::ReplyLost => Err(Error::AlreadyClosed(
                channel
                    .close_reason()
                    .unwrap_or_else(|| "reply channel closed".to_string()),
            )),
            Race::TimedOut => match channel.close_reason() {
                Some(reason) => Err(Error::AlreadyClosed(reason)),
                None => {
                    warn!(queue = %queue, correlation_id = %correlation_id, timeout = ?timeout, "RPC call timed out");
                    Err(Error::Timeout(timeout))
                }
            },
            Race::Cancelled => Err(Error::Cancelled),
        }
    }
}

async fn race(
    reply: oneshot::Receiver<Vec<u8>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Race {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Race::Cancelled,
        reply = reply => match reply {
            Ok(body) => Race::Reply(body),
            Err(_) => Race::ReplyLost,
        },
        _ = tokio::time::sleep(timeout) => Race::TimedOut,
    }
}

/// Background task feeding matching replies into the correlation table.
struct ReplyListener {
    task: JoinHandle<()>,
}

impl ReplyListener {
    fn spawn(consumer: Consumer, pending: Arc<PendingCalls>, correlation_id: &str) -> Self {
        let correlation_id = correlation_id.to_string();
        let mut deliveries = consumer.deliveries;
        let task = tokio::spawn(async move {
            while let Some(item) = deliveries.next().await {
                let Ok(delivery) = item else {
                    break;
                };
                if delivery.properties.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                    debug!(expected = %correlation_id, "Ignoring reply with foreign correlation id");
                    continue;
                }
                if let Some(call) = pending.take(&correlation_id) {
                    debug!(correlation_id = %correlation_id, elapsed = ?call.age(), "RPC reply received");
                    call.complete(delivery.body);
                }
                return;
            }
            // Reply stream ended without a reply: release the waiter.
            pending.take(&correlation_id);
        });
        Self { task }
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn decode_reply<Resp: Payload>(body: &[u8]) -> Result<Resp> {
    let outcome: RpcOutcome<serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| Error::ResponseDeserialization(e.to_string()))?;

    if let Some(message) = outcome.error_message() {
        return Err(Error::RpcHandling(message.to_string()));
    }
    let payload = outcome.payload.ok_or_else(|| {
        Error::InvalidResponse("response carries neither payload nor error".to_string())
    })?;
    let response: Resp = serde_json::from_value(payload)
        .map_err(|e| Error::ResponseDeserialization(e.to_string()))?;
    response
        .validate()
        .map_err(|e| Error::InvalidResponse(format!("invalid payload: {}", e)))?;
    Ok(response)
}

fn sending(e: Error) -> Error {
    match e {
        Error::Sending(_) => e,
        other => Error::Sending(other.to_string()),
    }
}
