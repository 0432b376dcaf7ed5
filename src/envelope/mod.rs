//! Wire envelope shared by every messaging pattern.
//!
//! Bodies are UTF-8 JSON of the form `{"Type": "<tag>", "Payload": {...}}`.
//! The type tag travels with the payload so a receiver can reject a message
//! of the wrong type as a validation failure rather than mis-decoding it.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A message body that can travel inside an [`Envelope`].
///
/// `validate` is the payload's invariant oracle: `Ok(())` when the payload
/// is acceptable, otherwise the list of violated rules.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Type identity carried on the wire and used in RPC queue names.
    ///
    /// Must be identical in every process that exchanges this payload, so
    /// pick a fixed string rather than anything derived from the Rust path.
    fn type_tag() -> &'static str;

    /// Check the payload's invariants.
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        Ok(())
    }
}

/// Violated invariants reported by [`Payload::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single violation.
    pub fn single(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    /// Record a violation.
    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// `Ok(())` if nothing was recorded.
    pub fn into_result(self) -> std::result::Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("unknown validation error");
        }
        f.write_str(&self.0.join(". "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Wrapper pairing a payload with its type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "Type")]
    pub type_tag: String,
    #[serde(rename = "Payload")]
    pub payload: T,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    #[serde(rename = "Type")]
    type_tag: &'a str,
    #[serde(rename = "Payload")]
    payload: &'a T,
}

impl<T: Payload> Envelope<T> {
    /// Wrap a payload, tagging it with its own type identity.
    pub fn new(payload: T) -> Self {
        Self {
            type_tag: T::type_tag().to_string(),
            payload,
        }
    }

    /// Encode a borrowed payload without building an owned envelope.
    pub fn encode(payload: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(&EnvelopeRef {
            type_tag: T::type_tag(),
            payload,
        })
        .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Encode this envelope as it stands (the tag is not rewritten).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode an envelope. Does not validate; see [`Envelope::validate`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::Deserialization(format!("body is not UTF-8: {}", e)))?;
        serde_json::from_str(text).map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Check the type tag against `T` and then the payload's own invariants.
    pub fn validate(&self) -> Result<()> {
        if self.type_tag != T::type_tag() {
            return Err(Error::Validation(format!(
                "payload type mismatch: expected '{}', got '{}'",
                T::type_tag(),
                self.type_tag
            )));
        }
        self.payload
            .validate()
            .map_err(|errors| Error::Validation(errors.to_string()))
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}
