//! Consumer lifecycle shared by every handler.
//!
//! A [`ConsumerLifecycle`] owns one long-lived channel per handler instance
//! and tracks the consumer subscriptions made on it. The handler counts as
//! running while at least one subscription is registered; transitions of
//! that aggregate flag are published as [`LifecycleEvent`]s, at most one
//! `Started` per false-to-true transition and one `Stopped` per
//! true-to-false transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Payload};
use crate::error::{Error, Result};
use crate::events::{EventSink, LifecycleEvent};
use crate::transport::{close_quietly, Channel, Connection, Delivery, QueueOptions, ScopedChannel};
use crate::validation::{validate_actor_id, validate_entity_name, validate_queue_name};


/// Processes deliveries for one consumer subscription.
///
/// Deliveries of a subscription are handled one at a time, in receipt order.
pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, channel: Arc<dyn Channel>, delivery: Delivery) -> BoxFuture<'static, ()>;
}

/// One active consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub tag: String,
    pub is_running: bool,
}

struct Registrations {
    entries: Mutex<Vec<ConsumerRegistration>>,
    events: EventSink<LifecycleEvent>,
    actor_id: String,
}

impl Registrations {
    fn lock(&self) -> MutexGuard<'_, Vec<ConsumerRegistration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn any_running(entries: &[ConsumerRegistration]) -> bool {
        entries.iter().any(|r| r.is_running)
    }

    fn register(&self, tag: &str) {
        let mut entries = self.lock();
        let was_running = Self::any_running(&entries);
        entries.push(ConsumerRegistration {
            tag: tag.to_string(),
            is_running: true,
        });
        // Emitted under the lock so transitions are observed in order.
        if !was_running {
            info!(actor_id = %self.actor_id, consumer_tag = %tag, "Consumer started");
            self.events.emit(LifecycleEvent::Started);
        }
    }

    fn unregister(&self, tag: &str) {
        let mut entries = self.lock();
        let was_running = Self::any_running(&entries);
        entries.retain(|r| r.tag != tag);
        if was_running && !Self::any_running(&entries) {
            info!(actor_id = %self.actor_id, consumer_tag = %tag, "Consumer stopped");
            self.events.emit(LifecycleEvent::Stopped);
        }
    }

    fn clear(&self) -> Vec<String> {
        let mut entries = self.lock();
        let was_running = Self::any_running(&entries);
        let tags = entries.drain(..).map(|r| r.tag).collect();
        if was_running {
            info!(actor_id = %self.actor_id, "Consumers stopped");
            self.events.emit(LifecycleEvent::Stopped);
        }
        tags
    }
}

struct OwnedQueue {
    name: String,
    delete_on_close: bool,
}

struct LifecycleInner {
    actor_id: String,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    registrations: Arc<Registrations>,
    owned_queue: Mutex<Option<OwnedQueue>>,
    closed: AtomicBool,
}

impl LifecycleInner {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tags = self.registrations.clear();
        for tag in tags {
            if !self.channel.is_open() {
                break;
            }
            if let Err(e) = self.channel.cancel(&tag).await {
                debug!(actor_id = %self.actor_id, consumer_tag = %tag, error = %e, "Consumer cancel failed, ignoring");
            }
        }

        let owned = self
            .owned_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(queue) = owned.filter(|q| q.delete_on_close) {
            if self.channel.is_open() {
                // Sibling instances may still consume from a shared queue.
                match self.channel.queue_delete(&queue.name, true).await {
                    Ok(_) => debug!(actor_id = %self.actor_id, queue = %queue.name, "Deleted handler queue"),
                    Err(e) => debug!(actor_id = %self.actor_id, queue = %queue.name, error = %e, "Handler queue kept"),
                }
            }
        }

        close_quietly(self.channel.as_ref()).await;
        debug!(actor_id = %self.actor_id, "Lifecycle closed");
    }
}

/// Owner of a handler's channel and consumer registrations.
pub struct ConsumerLifecycle {
    inner: Arc<LifecycleInner>,
}

impl ConsumerLifecycle {
    /// Open the handler's channel.
    ///
    /// Fails with `InvalidArgument` when `actor_id` is blank or the
    /// connection is already closed.
    pub async fn new(actor_id: &str, connection: Arc<dyn Connection>) -> Result<Self> {
        validate_actor_id(actor_id)?;
        if !connection.is_open() {
            return Err(Error::InvalidArgument("connection is closed".to_string()));
        }
        let channel = connection.create_channel().await?;

        Ok(Self {
            inner: Arc::new(LifecycleInner {
                actor_id: actor_id.to_string(),
                connection,
                channel,
                registrations: Arc::new(Registrations {
                    entries: Mutex::new(Vec::new()),
                    events: EventSink::new(),
                    actor_id: actor_id.to_string(),
                }),
                owned_queue: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn actor_id(&self) -> &str {
        &self.inner.actor_id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.connection
    }

    /// The handler's long-lived channel.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    /// True while at least one consumer subscription is registered.
    pub fn is_running(&self) -> bool {
        Registrations::any_running(&self.inner.registrations.lock())
    }

    pub fn registrations(&self) -> Vec<ConsumerRegistration> {
        self.inner.registrations.lock().clone()
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.registrations.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Record the queue this handler consumes from; optionally deleted on close.
    pub fn set_owned_queue(&self, name: &str, delete_on_close: bool) {
        *self
            .inner
            .owned_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(OwnedQueue {
            name: name.to_string(),
            delete_on_close,
        });
    }

    /// Subscribe to `queue` and drive deliveries through `handler`.
    ///
    /// The registration is added once the broker confirms the subscription
    /// and removed when the delivery stream ends (cancel, queue deleted,
    /// connection lost). Returns the consumer tag.
    pub async fn create_consumer(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String> {
        if self.is_closed() {
            return Err(Error::AlreadyClosed("handler is closed".to_string()));
        }
        let consumer = self
            .inner
            .channel
            .consume(queue, auto_ack)
            .await
            .map_err(|e| match e {
                Error::Subscription { .. } | Error::AlreadyClosed(_) => e,
                other => Error::Subscription {
                    queue: queue.to_string(),
                    message: other.to_string(),
                },
            })?;

        let tag = consumer.tag.clone();
        self.inner.registrations.register(&tag);

        let registrations = Arc::clone(&self.inner.registrations);
        let channel = Arc::clone(&self.inner.channel);
        let queue = queue.to_string();
        let consumer_tag = tag.clone();
        let mut deliveries = consumer.deliveries;
        tokio::spawn(async move {
            while let Some(item) = deliveries.next().await {
                match item {
                    Ok(delivery) => handler.handle(Arc::clone(&channel), delivery).await,
                    Err(e) => {
                        warn!(queue = %queue, consumer_tag = %consumer_tag, error = %e, "Consumer delivery error");
                        break;
                    }
                }
            }
            debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer stream ended");
            registrations.unregister(&consumer_tag);
        });

        Ok(tag)
    }

    /// Cancel consumers, delete the owned queue if configured, close the
    /// channel. Idempotent; cleanup failures are logged and swallowed.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl Drop for ConsumerLifecycle {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move {
                inner.close().await;
            });
        }
    }
}

/// Administrative broker operations, each on a short-lived channel.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Connection the auxiliary channels are opened on.
    fn admin_connection(&self) -> &dyn Connection;

    /// Declare a durable queue. `limit > 0` bounds it with reject-publish
    /// overflow. Redeclaring with identical arguments is a no-op.
    async fn declare_queue(&self, name: &str, limit: u32) -> Result<()> {
        validate_queue_name(name)?;
        let channel = ScopedChannel::open(self.admin_connection()).await?;
        let result = channel
            .queue_declare(name, QueueOptions::durable((limit > 0).then_some(limit)))
            .await;
        channel.close().await;
        result.map(|_| ())
    }

    /// Delete a queue. Deleting a missing queue is not an error.
    async fn delete_queue(&self, name: &str) -> Result<u32> {
        validate_entity_name(name)?;
        let channel = ScopedChannel::open(self.admin_connection()).await?;
        let result = channel.queue_delete(name, false).await;
        channel.close().await;
        result
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        validate_entity_name(name)?;
        let channel = ScopedChannel::open(self.admin_connection()).await?;
        let result = channel.exchange_delete(name).await;
        channel.close().await;
        result
    }

    /// Ready messages in an existing queue.
    async fn message_count(&self, name: &str) -> Result<u32> {
        validate_entity_name(name)?;
        let channel = ScopedChannel::open(self.admin_connection()).await?;
        let result = channel.queue_declare_passive(name).await;
        channel.close().await;
        result.map(|q| q.message_count)
    }

    /// Pull one message, decoded and validated. `Ok(None)` if the queue is empty.
    async fn fetch_message<T: Payload>(&self, queue: &str) -> Result<Option<T>>
    where
        Self: Sized,
    {
        validate_entity_name(queue)?;
        let channel = ScopedChannel::open(self.admin_connection()).await?;
        let result = channel.basic_get(queue).await;
        channel.close().await;

        let Some(delivery) = result? else {
            return Ok(None);
        };
        let envelope = Envelope::<T>::from_bytes(&delivery.body)?;
        envelope.validate()?;
        Ok(Some(envelope.into_payload()))
    }
}

impl BrokerAdmin for ConsumerLifecycle {
    fn admin_connection(&self) -> &dyn Connection {
        self.inner.connection.as_ref()
    }
}
