//! Broker transport abstraction.
//!
//! Handlers never talk to a client library directly. They receive an
//! already-open [`Connection`] and drive it through the [`Channel`] contract,
//! which is the subset of AMQP 0-9-1 the messaging patterns need.
//!
//! Implementations:
//! - `amqp::AmqpConnection`: RabbitMQ via lapin (feature `amqp`)
//! - `memory::MemoryBroker`: in-process broker for tests and local development

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use crate::error::Result;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;
pub use memory::{MemoryBroker, MemoryConnection};

/// Name of the broker's default (direct-to-queue) exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Message properties used by the messaging patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Pairs an RPC reply with its request.
    pub correlation_id: Option<String>,
    /// Queue the RPC reply should be published to.
    pub reply_to: Option<String>,
    /// Per-message time-to-live.
    pub expiration: Option<Duration>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    /// Properties for a JSON body.
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge the delivery. Zero means the
    /// broker supplied no usable tag.
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Bounded length with reject-publish overflow.
    pub max_length: Option<u32>,
}

impl QueueOptions {
    /// Durable shared queue, optionally bounded.
    pub fn durable(max_length: Option<u32>) -> Self {
        Self {
            durable: true,
            max_length,
            ..Default::default()
        }
    }

    /// Non-durable shared queue that outlives its consumers.
    pub fn transient() -> Self {
        Self::default()
    }

    /// Private queue removed with its last consumer.
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            max_length: None,
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// Queue name (server-generated when declared with an empty name).
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Broker verdict on a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Broker accepted the message.
    Ack,
    /// Broker refused the message (e.g. queue full under reject-publish).
    Nack,
    /// Mandatory message had no route.
    Returned { reply_text: String },
    /// Channel is not in confirm mode.
    NotRequested,
}

/// An active consumer subscription.
///
/// The delivery stream ends when the subscription is cancelled, whether by
/// the client, the broker (queue deleted) or the connection dropping.
pub struct Consumer {
    pub tag: String,
    pub deliveries: BoxStream<'static, Result<Delivery>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection can still open channels.
    fn is_open(&self) -> bool;

    /// Open a new channel.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<()>;
}

/// A broker channel.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Why the channel closed, if it closed for a reason other than a
    /// client-initiated close.
    fn close_reason(&self) -> Option<String>;

    /// Limit unacknowledged deliveries per consumer.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    /// Declare a queue. An empty name asks the broker to generate one.
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<DeclaredQueue>;

    /// Look up an existing queue without creating it.
    async fn queue_declare_passive(&self, name: &str) -> Result<DeclaredQueue>;

    /// Delete a queue, returning the number of messages dropped.
    ///
    /// With `if_unused` the broker refuses while any consumer remains.
    async fn queue_delete(&self, name: &str, if_unused: bool) -> Result<u32>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn exchange_declare_fanout(&self, name: &str) -> Result<()>;

    async fn exchange_delete(&self, name: &str) -> Result<()>;

    /// Put the channel into publisher-confirm mode.
    async fn confirm_select(&self) -> Result<()>;

    /// Publish and wait for the broker's verdict.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
        mandatory: bool,
    ) -> Result<Confirmation>;

    /// Start consuming from a queue.
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer>;

    /// Pull a single message (auto-acknowledged).
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Cancel a consumer; its delivery stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Close a channel, logging instead of propagating failures.
pub async fn close_quietly(channel: &dyn Channel) {
    if !channel.is_open() {
        return;
    }
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Channel close failed, ignoring");
    }
}

/// A short-lived channel that is closed on every exit path.
///
/// Call [`ScopedChannel::close`] on the normal path. If the guard is dropped
/// without it (early return, panic, cancelled future) a best-effort close is
/// spawned onto the current runtime.
pub struct ScopedChannel {
    channel: Arc<dyn Channel>,
    closed: bool,
}

impl ScopedChannel {
    /// Open a channel on `connection`.
    pub async fn open(connection: &dyn Connection) -> Result<Self> {
        let channel = connection.create_channel().await?;
        Ok(Self {
            channel,
            closed: false,
        })
    }

    /// Shared handle to the underlying channel.
    pub fn handle(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.channel)
    }

    pub async fn close(mut self) {
        self.closed = true;
        close_quietly(self.channel.as_ref()).await;
    }
}

impl Deref for ScopedChannel {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = Arc::clone(&self.channel);
            runtime.spawn(async move {
                close_quietly(channel.as_ref()).await;
            });
        }
    }
}
