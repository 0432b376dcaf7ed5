//! Events raised by consumers and handlers.
//!
//! Per-message failures never escape a consumer task. They are classified
//! into an [`ErrorKind`] and published on the handler's event channel, which
//! callers observe through a `tokio::sync::broadcast` receiver.

use std::fmt;

use tokio::sync::broadcast;

/// Capacity of every event channel. Slow receivers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Stage of the per-message pipeline at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown,
    Deserializing,
    Validating,
    Handling,
    Serializing,
    Sending,
    Acking,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::Deserializing => "deserializing",
            ErrorKind::Validating => "validating",
            ErrorKind::Handling => "handling",
            ErrorKind::Serializing => "serializing",
            ErrorKind::Sending => "sending",
            ErrorKind::Acking => "acking",
        };
        f.write_str(name)
    }
}

/// A classified per-message failure.
#[derive(Debug, Clone)]
pub struct ErrorEvent<T> {
    /// Actor that owns the handler reporting the failure.
    pub actor_id: String,
    /// Actor on the other side (broadcast source), when known.
    pub counterpart_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    /// Body as received, when the failure happened after receipt.
    pub raw: Option<Vec<u8>>,
    /// Decoded payload, when decoding got that far.
    pub incoming: Option<T>,
}

impl<T> ErrorEvent<T> {
    pub fn new(actor_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            counterpart_id: None,
            kind,
            message: message.into(),
            raw: None,
            incoming: None,
        }
    }

    pub fn with_counterpart(mut self, counterpart_id: Option<String>) -> Self {
        self.counterpart_id = counterpart_id;
        self
    }

    pub fn with_raw(mut self, raw: &[u8]) -> Self {
        self.raw = Some(raw.to_vec());
        self
    }

    pub fn with_incoming(mut self, incoming: T) -> Self {
        self.incoming = Some(incoming);
        self
    }
}

/// Events from a queue or broadcast subscriber.
#[derive(Debug, Clone)]
pub enum PumpEvent<T> {
    /// A message decoded and validated; the handler is about to run.
    Incoming(T),
    /// The handler returned successfully.
    Handled(T),
    Error(ErrorEvent<T>),
}

impl<T> PumpEvent<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, PumpEvent::Error(_))
    }
}

/// Aggregate consumer-state transitions of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// First consumer registered (not running -> running).
    Started,
    /// Last consumer went away (running -> not running).
    Stopped,
}

/// Broadcast sender that tolerates having no receivers.
#[derive(Debug)]
pub struct EventSink<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventSink<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

impl<E: Clone> Default for EventSink<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
