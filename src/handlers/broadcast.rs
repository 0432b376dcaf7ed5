//! Fanout subscriber.
//!
//! Each subscriber gets its own private, server-named queue bound to the
//! source actor's fanout exchange and consumes it with auto-ack. A message
//! lost to a subscriber failure is acceptable for this pattern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{open_envelope, run_guarded, MessageHandler};
use crate::envelope::Payload;
use crate::error::{Error, Result};
use crate::events::{ErrorEvent, ErrorKind, EventSink, LifecycleEvent, PumpEvent};
use crate::lifecycle::{BrokerAdmin, ConsumerLifecycle, DeliveryHandler};
use crate::transport::{Channel, Connection, Delivery, QueueOptions};
use crate::validation::{broadcast_exchange_name, validate_actor_id};

struct BroadcastPipeline<T> {
    actor_id: String,
    source_actor_id: String,
    handler: Arc<dyn MessageHandler<T>>,
    events: EventSink<PumpEvent<T>>,
}

impl<T: Payload> BroadcastPipeline<T> {
    fn error(&self, kind: ErrorKind, message: impl Into<String>, raw: &[u8]) -> ErrorEvent<T> {
        ErrorEvent::new(&self.actor_id, kind, message)
            .with_counterpart(Some(self.source_actor_id.clone()))
            .with_raw(raw)
    }

    async fn process(&self, delivery: Delivery) {
        let raw = delivery.body;
        let message = match open_envelope::<T>(&raw) {
            Ok(message) => message,
            Err(rejected) => {
                debug!(actor_id = %self.actor_id, source = %self.source_actor_id, kind = %rejected.kind, "Rejected broadcast");
                let mut event = self.error(rejected.kind, rejected.message, &raw);
                event.incoming = rejected.incoming;
                self.events.emit(PumpEvent::Error(event));
                return;
            }
        };

        self.events.emit(PumpEvent::Incoming(message.clone()));
        match run_guarded(self.handler.handle(message.clone())).await {
            Ok(()) => self.events.emit(PumpEvent::Handled(message)),
            Err(e) => {
                warn!(actor_id = %self.actor_id, source = %self.source_actor_id, error = %e, "Broadcast handler failed");
                let event = self.error(ErrorKind::Handling, e, &raw).with_incoming(message);
                self.events.emit(PumpEvent::Error(event));
            }
        }
    }
}

impl<T: Payload> DeliveryHandler for BroadcastPipeline<T> {
    fn handle(&self, _channel: Arc<dyn Channel>, delivery: Delivery) -> BoxFuture<'static, ()> {
        let pipeline = BroadcastPipeline {
            actor_id: self.actor_id.clone(),
            source_actor_id: self.source_actor_id.clone(),
            handler: Arc::clone(&self.handler),
            events: self.events.clone(),
        };
        Box::pin(async move { pipeline.process(delivery).await })
    }
}

/// Subscriber to another actor's broadcasts.
pub struct BroadcastHandler<T: Payload> {
    lifecycle: ConsumerLifecycle,
    exchange: String,
    /// Claimed by the first `start`, released again if it fails.
    started: AtomicBool,
    queue: OnceLock<String>,
    pipeline: Arc<BroadcastPipeline<T>>,
}

impl<T: Payload> BroadcastHandler<T> {
    /// `source_actor_id` is the actor whose broadcasts are received.
    pub async fn new<H>(
        actor_id: &str,
        connection: Arc<dyn Connection>,
        source_actor_id: &str,
        handler: H,
    ) -> Result<Self>
    where
        H: MessageHandler<T>,
    {
        validate_actor_id(source_actor_id)?;
        let lifecycle = ConsumerLifecycle::new(actor_id, connection).await?;

        Ok(Self {
            exchange: broadcast_exchange_name(source_actor_id),
            started: AtomicBool::new(false),
            queue: OnceLock::new(),
            pipeline: Arc::new(BroadcastPipeline {
                actor_id: actor_id.to_string(),
                source_actor_id: source_actor_id.to_string(),
                handler: Arc::new(handler),
                events: EventSink::new(),
            }),
            lifecycle,
        })
    }

    /// Declare the exchange, bind a private queue and start consuming.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidArgument(
                "broadcast handler already started".to_string(),
            ));
        }
        let result = self.subscribe().await;
        if result.is_err() {
            self.started.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn subscribe(&self) -> Result<()> {
        let channel = self.lifecycle.channel();
        channel.exchange_declare_fanout(&self.exchange).await?;
        let declared = channel.queue_declare("", QueueOptions::private()).await?;
        channel.queue_bind(&declared.name, &self.exchange, "").await?;
        self.lifecycle.set_owned_queue(&declared.name, true);

        self.lifecycle
            .create_consumer(&declared.name, true, self.pipeline.clone())
            .await?;
        info!(
            actor_id = %self.lifecycle.actor_id(),
            exchange = %self.exchange,
            queue = %declared.name,
            "Broadcast handler started"
        );
        let _ = self.queue.set(declared.name);
        Ok(())
    }

    pub fn actor_id(&self) -> &str {
        self.lifecycle.actor_id()
    }

    pub fn source_actor_id(&self) -> &str {
        &self.pipeline.source_actor_id
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    /// The private queue, once started.
    pub fn queue_name(&self) -> Option<&str> {
        self.queue.get().map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn events(&self) -> broadcast::Receiver<PumpEvent<T>> {
        self.pipeline.events.subscribe()
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.lifecycle_events()
    }

    /// Stop consuming, delete the private queue, close the channel.
    pub async fn close(&self) {
        self.lifecycle.close().await;
    }
}

impl<T: Payload> BrokerAdmin for BroadcastHandler<T> {
    fn admin_connection(&self) -> &dyn Connection {
        self.lifecycle.admin_connection()
    }
}
