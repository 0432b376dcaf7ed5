//! Correlated request/response between actors.
//!
//! A request travels to the deterministic queue `rpc_{actor}_{type}` with a
//! fresh correlation id and a private reply queue. The [`RpcHandler`] runs
//! the business function and always replies with an [`RpcOutcome`]; the
//! [`RpcClient`] races that reply against the timeout and the caller's
//! cancellation token.

pub mod client;
pub mod handler;
pub mod outcome;
pub mod pending;


pub use client::RpcClient;
pub use handler::{RequestHandler, RpcEvent, RpcHandler};
pub use outcome::RpcOutcome;
pub use pending::{PendingCall, PendingCalls};
