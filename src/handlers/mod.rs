//! Subscribers for the queue and broadcast patterns.
//!
//! Both run the same per-message pipeline: decode the envelope, validate
//! the payload, emit `Incoming`, run the user handler, emit `Handled`.
//! Every failure is classified and reported as a [`PumpEvent::Error`]; one
//! bad message never stops the consumer.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::envelope::{Envelope, Payload};
use crate::error::{Error, HandlerError};
use crate::events::ErrorKind;

pub mod broadcast;
pub mod queue;

#[cfg(test)]
mod tests;

pub use broadcast::BroadcastHandler;
pub use queue::QueueHandler;

/// User function invoked for each valid message.
///
/// Implemented for any `Fn(T) -> impl Future<Output = Result<(), HandlerError>>`.
pub trait MessageHandler<T>: Send + Sync + 'static {
    fn handle(&self, message: T) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<T, F, Fut> MessageHandler<T> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: T) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(message))
    }
}

/// Why a body could not be turned into a valid payload.
pub(crate) struct Rejected<T> {
    pub kind: ErrorKind,
    pub message: String,
    /// Present when decoding succeeded but validation failed.
    pub incoming: Option<T>,
}

/// Decode and validate an envelope body.
pub(crate) fn open_envelope<T: Payload>(raw: &[u8]) -> Result<T, Rejected<T>> {
    let envelope = Envelope::<T>::from_bytes(raw).map_err(|e| Rejected {
        kind: ErrorKind::Deserializing,
        message: e.to_string(),
        incoming: None,
    })?;
    if let Err(e) = envelope.validate() {
        let kind = match e {
            Error::Validation(_) => ErrorKind::Validating,
            _ => ErrorKind::Unknown,
        };
        return Err(Rejected {
            kind,
            message: e.to_string(),
            incoming: Some(envelope.into_payload()),
        });
    }
    Ok(envelope.into_payload())
}

/// Run a user future, turning both returned errors and panics into a message.
pub(crate) async fn run_guarded<R>(
    future: BoxFuture<'static, Result<R, HandlerError>>,
) -> Result<R, String> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
