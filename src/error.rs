//! Error types shared by every messaging pattern.
//!
//! Every public call either succeeds or fails with exactly one of these
//! variants. Per-message failures inside consumers never surface here; they
//! are reported through handler events instead (see [`crate::events`]).

/// Result type for warren operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by user handler functions.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid argument provided by the caller (blank actor id, reserved
    /// queue name, invalid request payload, closed connection).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Numeric argument outside its permitted range.
    #[error("{name} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Outgoing payload could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Incoming body could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Decoded payload failed its invariants.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Consumer subscription could not be established.
    #[error("subscription to '{queue}' failed: {message}")]
    Subscription { queue: String, message: String },

    /// Publish failed, or the confirmation could not be awaited.
    #[error("sending failed: {0}")]
    Sending(String),

    /// Broker negatively acknowledged a published message.
    #[error("message rejected by broker (nack)")]
    MessageNack,

    /// Broker returned a mandatory message as unroutable.
    #[error("message could not be routed: {0}")]
    MessageRouting(String),

    /// RPC call received no reply within its effective timeout.
    #[error("rpc call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// RPC call was cancelled by the caller.
    #[error("rpc call cancelled")]
    Cancelled,

    /// Connection or channel was already closed.
    #[error("already closed: {0}")]
    AlreadyClosed(String),

    /// Remote handler failed; carries its message verbatim.
    #[error("rpc handling failed: {0}")]
    RpcHandling(String),

    /// Reply decoded but violated the outcome invariants.
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),

    /// Reply body could not be decoded.
    #[error("rpc response deserialization failed: {0}")]
    ResponseDeserialization(String),

    /// Any other broker-level failure.
    #[error("broker error: {0}")]
    Broker(String),
}

impl Error {
    /// Returns true if this is an argument validation failure.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_) | Error::OutOfRange { .. })
    }

    /// Returns true if the connection or channel was gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::AlreadyClosed(_))
    }

    /// Returns true if the failure came from the remote side of an RPC call.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::RpcHandling(_) | Error::InvalidResponse(_) | Error::ResponseDeserialization(_)
        )
    }

    /// Returns true if the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Sending(_) | Error::MessageNack | Error::AlreadyClosed(_)
        )
    }
}
