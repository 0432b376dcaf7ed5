//! RPC response body.

use serde::{Deserialize, Serialize};

/// Reply to an RPC request: exactly one of `payload` and `error` is set.
///
/// Wire form: `{"Payload": {...} | null, "Error": "<message>" | null}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcOutcome<T> {
    #[serde(rename = "Payload")]
    pub payload: Option<T>,
    #[serde(rename = "Error")]
    pub error: Option<String>,
}

impl<T> RpcOutcome<T> {
    pub fn success(payload: T) -> Self {
        Self {
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            payload: None,
            error: Some(error.into()),
        }
    }

    /// The error message, ignoring blank strings.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }

    /// Exactly one of payload and (non-blank) error is present.
    pub fn is_valid(&self) -> bool {
        self.payload.is_some() != self.error_message().is_some()
    }
}
