//! RPC server side.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::outcome::RpcOutcome;
use crate::config::HandlerConfig;
use crate::envelope::Payload;
use crate::error::{HandlerError, Result};
use crate::events::{ErrorKind, EventSink, LifecycleEvent};
use crate::handlers::{open_envelope, run_guarded};
use crate::lifecycle::{BrokerAdmin, ConsumerLifecycle, DeliveryHandler};
use crate::transport::{Channel, Connection, Delivery, MessageProperties, QueueOptions, DEFAULT_EXCHANGE};
use crate::validation::{rpc_queue_name, validate_concurrency, validate_entity_name};

/// Error constants for malformed requests.
pub mod errmsg {
    pub const NO_REPLY_TO: &str = "request has no reply-to queue";
    pub const NO_CORRELATION_ID: &str = "request has no correlation id";
    pub const NO_DELIVERY_TAG: &str = "request has no delivery tag";
}

/// Business function serving one request type.
///
/// Implemented for any `Fn(Req) -> impl Future<Output = Result<Resp, HandlerError>>`.
pub trait RequestHandler<Req, Resp>: Send + Sync + 'static {
    fn handle(&self, request: Req) -> BoxFuture<'static, std::result::Result<Resp, HandlerError>>;
}

impl<Req, Resp, F, Fut> RequestHandler<Req, Resp> for F
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
{
    fn handle(&self, request: Req) -> BoxFuture<'static, std::result::Result<Resp, HandlerError>> {
        Box::pin(self(request))
    }
}

/// Events raised while serving requests.
#[derive(Debug, Clone)]
pub enum RpcEvent<Req, Resp> {
    /// Protocol defect (no reply-to, correlation id or delivery tag). The
    /// delivery is dropped without a reply or an ack.
    InvalidRequest { raw: Vec<u8>, reason: String },
    /// Body could not be decoded (`Deserializing`) or failed validation
    /// (`Validating`). The caller gets an error reply.
    RequestRejected {
        kind: ErrorKind,
        correlation_id: String,
        raw: Vec<u8>,
        message: String,
        request: Option<Req>,
    },
    /// The business function is about to run.
    Handling(Req),
    /// The business function failed or panicked.
    HandlingError { request: Req, message: String },
    /// A reply was published.
    ResponseSent {
        correlation_id: String,
        request: Option<Req>,
        outcome: RpcOutcome<Resp>,
    },
    /// The reply could not be serialized (`Serializing`) or published (`Sending`).
    SendResponseError {
        kind: ErrorKind,
        correlation_id: String,
        message: String,
    },
    /// The delivery could not be acknowledged.
    AckError {
        correlation_id: String,
        message: String,
    },
}

impl<Req, Resp> RpcEvent<Req, Resp> {
    /// Classified failure kind, if this event reports one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            RpcEvent::InvalidRequest { .. } => Some(ErrorKind::Unknown),
            RpcEvent::RequestRejected { kind, .. } | RpcEvent::SendResponseError { kind, .. } => {
                Some(*kind)
            }
            RpcEvent::HandlingError { .. } => Some(ErrorKind::Handling),
            RpcEvent::AckError { .. } => Some(ErrorKind::Acking),
            RpcEvent::Handling(_) | RpcEvent::ResponseSent { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_kind().is_some()
    }
}

struct RpcPipeline<Req, Resp> {
    actor_id: String,
    queue: String,
    handler: Arc<dyn RequestHandler<Req, Resp>>,
    events: EventSink<RpcEvent<Req, Resp>>,
}

impl<Req: Payload, Resp: Payload> RpcPipeline<Req, Resp> {
    fn invalid(&self, raw: Vec<u8>, reason: &str) {
        warn!(actor_id = %self.actor_id, queue = %self.queue, reason = %reason, "Invalid RPC request dropped");
        self.events.emit(RpcEvent::InvalidRequest {
            raw,
            reason: reason.to_string(),
        });
    }

    async fn process(&self, channel: &dyn Channel, delivery: Delivery) {
        let Delivery {
            delivery_tag,
            body: raw,
            properties,
            ..
        } = delivery;

        let Some(reply_to) = properties.reply_to.filter(|r| !r.trim().is_empty()) else {
            return self.invalid(raw, errmsg::NO_REPLY_TO);
        };
        let Some(correlation_id) = properties
            .correlation_id
            .filter(|c| !c.trim().is_empty())
        else {
            return self.invalid(raw, errmsg::NO_CORRELATION_ID);
        };
        if delivery_tag == 0 {
            return self.invalid(raw, errmsg::NO_DELIVERY_TAG);
        }

        let (request, outcome) = self.execute(&correlation_id, raw).await;
        self.respond(channel, &reply_to, &correlation_id, request, outcome)
            .await;

        if !channel.is_open() {
            debug!(actor_id = %self.actor_id, correlation_id = %correlation_id, "Channel closed, skipping ack");
            return;
        }
        if let Err(e) = channel.ack(delivery_tag).await {
            warn!(actor_id = %self.actor_id, correlation_id = %correlation_id, error = %e, "Ack failed");
            self.events.emit(RpcEvent::AckError {
                correlation_id,
                message: e.to_string(),
            });
        }
    }

    async fn execute(&self, correlation_id: &str, raw: Vec<u8>) -> (Option<Req>, RpcOutcome<Resp>) {
        let request = match open_envelope::<Req>(&raw) {
            Ok(request) => request,
            Err(rejected) => {
                debug!(actor_id = %self.actor_id, correlation_id = %correlation_id, kind = %rejected.kind, "RPC request rejected");
                let outcome = RpcOutcome::failure(rejected.message.clone());
                self.events.emit(RpcEvent::RequestRejected {
                    kind: rejected.kind,
                    correlation_id: correlation_id.to_string(),
                    raw,
                    message: rejected.message,
                    request: rejected.incoming.clone(),
                });
                return (rejected.incoming, outcome);
            }
        };

        self.events.emit(RpcEvent::Handling(request.clone()));
        match run_guarded(self.handler.handle(request.clone())).await {
            Ok(response) => (Some(request), RpcOutcome::success(response)),
            Err(message) => {
                warn!(actor_id = %self.actor_id, correlation_id = %correlation_id, error = %message, "RPC handler failed");
                self.events.emit(RpcEvent::HandlingError {
                    request: request.clone(),
                    message: message.clone(),
                });
                (Some(request), RpcOutcome::failure(message))
            }
        }
    }

    async fn respond(
        &self,
        channel: &dyn Channel,
        reply_to: &str,
        correlation_id: &str,
        request: Option<Req>,
        outcome: RpcOutcome<Resp>,
    ) {
        let (body, outcome) = match serde_json::to_vec(&outcome) {
            Ok(body) => (body, outcome),
            Err(e) => {
                self.events.emit(RpcEvent::SendResponseError {
                    kind: ErrorKind::Serializing,
                    correlation_id: correlation_id.to_string(),
                    message: e.to_string(),
                });
                // The caller still gets a typed failure instead of a timeout.
                let fallback = RpcOutcome::failure(format!("response serialization failed: {}", e));
                match serde_json::to_vec(&fallback) {
                    Ok(body) => (body, fallback),
                    Err(_) => return,
                }
            }
        };

        let properties = MessageProperties::json().with_correlation_id(correlation_id);
        match channel
            .publish(DEFAULT_EXCHANGE, reply_to, &body, properties, false)
            .await
        {
            Ok(_) => {
                debug!(actor_id = %self.actor_id, correlation_id = %correlation_id, "RPC response sent");
                self.events.emit(RpcEvent::ResponseSent {
                    correlation_id: correlation_id.to_string(),
                    request,
                    outcome,
                });
            }
            Err(e) => {
                warn!(actor_id = %self.actor_id, correlation_id = %correlation_id, error = %e, "RPC response publish failed");
                self.events.emit(RpcEvent::SendResponseError {
                    kind: ErrorKind::Sending,
                    correlation_id: correlation_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}

impl<Req: Payload, Resp: Payload> DeliveryHandler for RpcPipeline<Req, Resp> {
    fn handle(&self, channel: Arc<dyn Channel>, delivery: Delivery) -> BoxFuture<'static, ()> {
        let pipeline = RpcPipeline {
            actor_id: self.actor_id.clone(),
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            events: self.events.clone(),
        };
        Box::pin(async move { pipeline.process(channel.as_ref(), delivery).await })
    }
}

/// Serves `Req` requests addressed to one actor.
///
/// Listens on `rpc_{actor_id}_{Req::type_tag()}` with `concurrency`
/// consumers at prefetch 1, so up to `concurrency` requests run at once.
/// Every delivered request gets a reply, success or typed failure.
pub struct RpcHandler<Req: Payload, Resp: Payload> {
    lifecycle: ConsumerLifecycle,
    queue: String,
    concurrency: u16,
    delete_queue_on_close: bool,
    pipeline: Arc<RpcPipeline<Req, Resp>>,
}

impl<Req: Payload, Resp: Payload> RpcHandler<Req, Resp> {
    pub async fn new<H>(
        actor_id: &str,
        connection: Arc<dyn Connection>,
        concurrency: u16,
        handler: H,
    ) -> Result<Self>
    where
        H: RequestHandler<Req, Resp>,
    {
        validate_concurrency(concurrency)?;
        let lifecycle = ConsumerLifecycle::new(actor_id, connection).await?;
        let queue = rpc_queue_name(actor_id, Req::type_tag());
        validate_entity_name(&queue)?;

        Ok(Self {
            pipeline: Arc::new(RpcPipeline {
                actor_id: actor_id.to_string(),
                queue: queue.clone(),
                handler: Arc::new(handler),
                events: EventSink::new(),
            }),
            lifecycle,
            queue,
            concurrency,
            delete_queue_on_close: HandlerConfig::default().delete_queue_on_close,
        })
    }

    /// Whether [`RpcHandler::close`] deletes the request queue (default true).
    pub fn with_delete_queue_on_close(mut self, delete: bool) -> Self {
        self.delete_queue_on_close = delete;
        self
    }

    pub fn with_config(self, config: &HandlerConfig) -> Self {
        self.with_delete_queue_on_close(config.delete_queue_on_close)
    }

    /// Declare the request queue and start consuming. A no-op while running.
    pub async fn start(&self) -> Result<()> {
        if self.lifecycle.is_running() {
            return Ok(());
        }
        let channel = self.lifecycle.channel();
        channel
            .queue_declare(&self.queue, QueueOptions::transient())
            .await?;
        channel.basic_qos(1).await?;
        self.lifecycle
            .set_owned_queue(&self.queue, self.delete_queue_on_close);

        for _ in 0..self.concurrency {
            self.lifecycle
                .create_consumer(&self.queue, false, self.pipeline.clone())
                .await?;
        }
        info!(
            actor_id = %self.lifecycle.actor_id(),
            queue = %self.queue,
            concurrency = self.concurrency,
            "RPC handler started"
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

    pub fn events(&self) -> broadcast::Receiver<RpcEvent<Req, Resp>> {
        self.pipeline.events.subscribe()
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.lifecycle_events()
    }

    pub async fn close(&self) {
        self.lifecycle.close().await;
    }
}

impl<Req: Payload, Resp: Payload> BrokerAdmin for RpcHandler<Req, Resp> {
    fn admin_connection(&self) -> &dyn Connection {
        self.lifecycle.admin_connection()
    }
}
