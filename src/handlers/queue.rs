//! Bounded-concurrency subscriber over a named queue.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{open_envelope, run_guarded, MessageHandler};
use crate::envelope::Payload;
use crate::error::Result;
use crate::events::{ErrorEvent, ErrorKind, EventSink, LifecycleEvent, PumpEvent};
use crate::lifecycle::{BrokerAdmin, ConsumerLifecycle, DeliveryHandler};
use crate::transport::{Channel, Connection, Delivery};
use crate::validation::{validate_concurrency, validate_queue_name};

struct QueuePipeline<T> {
    actor_id: String,
    queue: String,
    handler: Arc<dyn MessageHandler<T>>,
    events: EventSink<PumpEvent<T>>,
}

impl<T: Payload> QueuePipeline<T> {
    async fn process(&self, channel: &dyn Channel, delivery: Delivery) {
        let raw = delivery.body;
        match open_envelope::<T>(&raw) {
            Err(rejected) => {
                debug!(actor_id = %self.actor_id, queue = %self.queue, kind = %rejected.kind, "Rejected message");
                let mut event = ErrorEvent::new(&self.actor_id, rejected.kind, rejected.message)
                    .with_raw(&raw);
                event.incoming = rejected.incoming;
                self.events.emit(PumpEvent::Error(event));
            }
            Ok(message) => {
                self.events.emit(PumpEvent::Incoming(message.clone()));
                match run_guarded(self.handler.handle(message.clone())).await {
                    Ok(()) => self.events.emit(PumpEvent::Handled(message)),
                    Err(e) => {
                        warn!(actor_id = %self.actor_id, queue = %self.queue, error = %e, "Handler failed");
                        self.events.emit(PumpEvent::Error(
                            ErrorEvent::new(&self.actor_id, ErrorKind::Handling, e)
                                .with_raw(&raw)
                                .with_incoming(message),
                        ));
                    }
                }
            }
        }

        // Acknowledged after every outcome so bad messages are drained.
        if let Err(e) = channel.ack(delivery.delivery_tag).await {
            warn!(actor_id = %self.actor_id, queue = %self.queue, error = %e, "Ack failed");
            self.events.emit(PumpEvent::Error(
                ErrorEvent::new(&self.actor_id, ErrorKind::Acking, e.to_string()).with_raw(&raw),
            ));
        }
    }
}

impl<T: Payload> DeliveryHandler for QueuePipeline<T> {
    fn handle(&self, channel: Arc<dyn Channel>, delivery: Delivery) -> BoxFuture<'static, ()> {
        let pipeline = QueuePipeline {
            actor_id: self.actor_id.clone(),
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            events: self.events.clone(),
        };
        Box::pin(async move { pipeline.process(channel.as_ref(), delivery).await })
    }
}

/// Subscriber over a named, pre-declared queue.
///
/// Runs `concurrency` consumers at prefetch 1 with manual acknowledgment.
/// Order is preserved per consumer, not across consumers.
pub struct QueueHandler<T: Payload> {
    lifecycle: ConsumerLifecycle,
    queue: String,
    concurrency: u16,
    pipeline: Arc<QueuePipeline<T>>,
}

impl<T: Payload> QueueHandler<T> {
    pub async fn new<H>(
        actor_id: &str,
        connection: Arc<dyn Connection>,
        queue: &str,
        concurrency: u16,
        handler: H,
    ) -> Result<Self>
    where
        H: MessageHandler<T>,
    {
        validate_queue_name(queue)?;
        validate_concurrency(concurrency)?;
        let lifecycle = ConsumerLifecycle::new(actor_id, connection).await?;

        Ok(Self {
            pipeline: Arc::new(QueuePipeline {
                actor_id: actor_id.to_string(),
                queue: queue.to_string(),
                handler: Arc::new(handler),
                events: EventSink::new(),
            }),
            lifecycle,
            queue: queue.to_string(),
            concurrency,
        })
    }

    /// Start consuming. A no-op while already running.
    pub async fn start(&self) -> Result<()> {
        if self.lifecycle.is_running() {
            return Ok(());
        }
        self.lifecycle.channel().basic_qos(1).await?;
        for _ in 0..self.concurrency {
            self.lifecycle
                .create_consumer(&self.queue, false, self.pipeline.clone())
                .await?;
        }
        info!(
            actor_id = %self.lifecycle.actor_id(),
            queue = %self.queue,
            concurrency = self.concurrency,
            "Queue handler started"
        );
        Ok(())
    }

    pub fn actor_id(&self) -> &str {
        self.lifecycle.actor_id()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> u16 {
        self.concurrency
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

    /// Stop consuming and close the channel. The queue itself is kept.
    pub async fn close(&self) {
        self.lifecycle.close().await;
    }
}

impl<T: Payload> BrokerAdmin for QueueHandler<T> {
    fn admin_connection(&self) -> &dyn Connection {
        self.lifecycle.admin_connection()
    }
}
