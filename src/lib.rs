//! Warren - actor messaging over AMQP
//!
//! Queue, broadcast and correlated request/reply patterns between actors
//! sharing a RabbitMQ broker, with JSON envelopes, typed payload validation
//! and per-handler event streams.

pub mod config;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handlers;
pub mod lifecycle;
pub mod rpc;
pub mod transport;
pub mod utils;
pub mod validation;

pub use emitter::Emitter;
pub use envelope::{Envelope, Payload, ValidationErrors};
pub use error::{Error, HandlerError, Result};
pub use events::{ErrorEvent, ErrorKind, LifecycleEvent, PumpEvent};
pub use handlers::{BroadcastHandler, MessageHandler, QueueHandler};
pub use lifecycle::{BrokerAdmin, ConsumerLifecycle};
pub use rpc::{RequestHandler, RpcClient, RpcEvent, RpcHandler, RpcOutcome};
pub use transport::{Connection, MemoryBroker};
