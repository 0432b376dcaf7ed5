//! Shared payloads and helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use warren::{Payload, ValidationErrors};

/// Largest operand the multiplication service accepts.
pub const MAX_OPERAND: i64 = 1_000_000;

/// Request served by the multiplication handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Multiply {
    pub first_number: i64,
    pub second_number: i64,
}

impl Payload for Multiply {
    fn type_tag() -> &'static str {
        "Multiply"
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.first_number.abs() > MAX_OPERAND {
            errors.push("FirstNumber is out of range");
        }
        if self.second_number.abs() > MAX_OPERAND {
            errors.push("SecondNumber is out of range");
        }
        errors.into_result()
    }
}

/// Same wire shape and tag as [`Multiply`] without its invariants, so a
/// client can put an invalid request on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UncheckedMultiply {
    pub first_number: i64,
    pub second_number: i64,
}

impl Payload for UncheckedMultiply {
    fn type_tag() -> &'static str {
        "Multiply"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Product {
    pub result: i64,
}

impl Payload for Product {
    fn type_tag() -> &'static str {
        "Product"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    pub text: String,
}

impl Payload for Notification {
    fn type_tag() -> &'static str {
        "Notification"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkItem {
    pub id: u32,
}

impl Payload for WorkItem {
    fn type_tag() -> &'static str {
        "WorkItem"
    }
}

pub fn multiply(first_number: i64, second_number: i64) -> Multiply {
    Multiply {
        first_number,
        second_number,
    }
}

/// Wait for the next event, failing the test after five seconds.
pub async fn next_event<E: Clone>(rx: &mut broadcast::Receiver<E>) -> E {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Every event already queued on `rx`.
pub fn drain<E: Clone>(rx: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

static LOGGING: Once = Once::new();

/// Install the tracing subscriber once per test binary (`WARREN_LOG` filters).
pub fn init_logging() {
    LOGGING.call_once(warren::utils::bootstrap::init_tracing);
}
