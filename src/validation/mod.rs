//! Input validation for broker entity names and actor identities.
//!
//! Every name that reaches the broker (queue, exchange, routing key) passes
//! through here first. Names derived from actor ids use reserved prefixes
//! that user-chosen queue names may not collide with.

use crate::error::{Error, Result};

/// Length limits for validated fields.
pub mod limits {
    /// Maximum broker entity name length (AMQP short string).
    pub const MAX_ENTITY_NAME_LENGTH: usize = 255;
    /// Minimum number of consumers per handler.
    pub const MIN_CONCURRENCY: u16 = 1;
    /// Maximum number of consumers per handler.
    pub const MAX_CONCURRENCY: u16 = 10;
}

/// Reserved entity name prefixes.
pub mod prefixes {
    /// Queue name prefix for RPC requests.
    pub const RPC_QUEUE: &str = "rpc_";
    /// Exchange name prefix for broadcast messages.
    pub const BROADCAST_EXCHANGE: &str = "broadcast_";
    /// Prefix the broker reserves for its own entities.
    pub const BROKER: &str = "amq.";
}

/// Error constants for validation failures.
pub mod errmsg {
    pub const ACTOR_ID_BLANK: &str = "actor id cannot be empty or blank";

    pub const NAME_BLANK: &str = "name cannot be empty or blank";
    pub const NAME_TOO_LONG: &str = "name exceeds maximum length";
    pub const NAME_INVALID_CHARS: &str = "name must contain printable US-ASCII characters only";
    pub const NAME_BROKER_PREFIX: &str = "name uses the broker-reserved prefix 'amq.'";
    pub const QUEUE_NAME_RESERVED_PREFIX: &str =
        "queue name uses a reserved prefix (reserved: rpc_, broadcast_)";
}

/// Validate an actor id.
///
/// Actor ids are opaque; the only rule is that they carry something other
/// than whitespace.
pub fn validate_actor_id(actor_id: &str) -> Result<()> {
    if actor_id.trim().is_empty() {
        return Err(Error::InvalidArgument(errmsg::ACTOR_ID_BLANK.to_string()));
    }
    Ok(())
}

/// Validate a broker entity name (queue or exchange).
///
/// Rules:
/// - Must not be empty or blank
/// - Maximum 255 bytes
/// - Printable US-ASCII only (0x20..=0x7E)
/// - Must not start with the broker-reserved `amq.` prefix
pub fn validate_entity_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument(errmsg::NAME_BLANK.to_string()));
    }
    if name.len() > limits::MAX_ENTITY_NAME_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "{} (max: {}, got: {})",
            errmsg::NAME_TOO_LONG,
            limits::MAX_ENTITY_NAME_LENGTH,
            name.len()
        )));
    }
    if !name.bytes().all(|b| matches!(b, 0x20..=0x7E)) {
        return Err(Error::InvalidArgument(format!(
            "{}: '{}'",
            errmsg::NAME_INVALID_CHARS,
            name.escape_default()
        )));
    }
    if name.starts_with(prefixes::BROKER) {
        return Err(Error::InvalidArgument(errmsg::NAME_BROKER_PREFIX.to_string()));
    }
    Ok(())
}

/// Validate a user-chosen queue name.
///
/// Applies [`validate_entity_name`] and additionally rejects the prefixes
/// reserved for RPC queues and broadcast exchanges.
pub fn validate_queue_name(name: &str) -> Result<()> {
    validate_entity_name(name)?;
    if name.starts_with(prefixes::RPC_QUEUE) || name.starts_with(prefixes::BROADCAST_EXCHANGE) {
        return Err(Error::InvalidArgument(format!(
            "{}: '{}'",
            errmsg::QUEUE_NAME_RESERVED_PREFIX,
            name
        )));
    }
    Ok(())
}

/// Validate a consumer count.
pub fn validate_concurrency(concurrency: u16) -> Result<()> {
    if !(limits::MIN_CONCURRENCY..=limits::MAX_CONCURRENCY).contains(&concurrency) {
        return Err(Error::OutOfRange {
            name: "concurrency",
            value: i64::from(concurrency),
            min: i64::from(limits::MIN_CONCURRENCY),
            max: i64::from(limits::MAX_CONCURRENCY),
        });
    }
    Ok(())
}

/// Name of the queue serving `type_tag` requests for `actor_id`.
pub fn rpc_queue_name(actor_id: &str, type_tag: &str) -> String {
    format!("{}{}_{}", prefixes::RPC_QUEUE, actor_id, type_tag)
}

/// Name of the fanout exchange carrying broadcasts from `actor_id`.
pub fn broadcast_exchange_name(actor_id: &str) -> String {
    format!("{}{}", prefixes::BROADCAST_EXCHANGE, actor_id)
}
