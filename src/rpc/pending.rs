//! Correlation table for in-flight RPC calls.
//!
//! The caller inserts an entry before publishing; whoever removes it first
//! (reply listener, or the caller on timeout/cancel/failure) owns the
//! resolution. Removal is a single map operation under one lock, so a call
//! is resolved at most once and late or duplicate replies find nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// One in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    pub correlation_id: String,
    completion: oneshot::Sender<Vec<u8>>,
    created_at: Instant,
}

impl PendingCall {
    /// Time since the request was registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Hand the reply body to the waiting caller. False if it stopped waiting.
    pub fn complete(self, body: Vec<u8>) -> bool {
        self.completion.send(body).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call and return the receiver its reply will arrive on.
    pub fn insert(&self, correlation_id: &str) -> oneshot::Receiver<Vec<u8>> {
        let (completion, receiver) = oneshot::channel();
        self.lock().insert(
            correlation_id.to_string(),
            PendingCall {
                correlation_id: correlation_id.to_string(),
                completion,
                created_at: Instant::now(),
            },
        );
        receiver
    }

    /// Remove a call. Only the first caller for a given id gets `Some`.
    pub fn take(&self, correlation_id: &str) -> Option<PendingCall> {
        self.lock().remove(correlation_id)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
