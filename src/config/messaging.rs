//! Broker and messaging-pattern configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Fallback RPC timeout when none (or a non-positive one) is configured.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 15;
/// Default bound on waiting for a publisher confirmation.
pub const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 5000;

/// AMQP connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Connection attempts before giving up.
    pub connect_retries: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connect_retries: 30,
        }
    }
}

/// RPC client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default call timeout in seconds. Values `<= 0` mean the fallback.
    pub default_timeout_secs: i64,
}

impl RpcConfig {
    /// The configured timeout with the non-positive fallback applied.
    pub fn default_timeout(&self) -> Duration {
        effective_timeout_secs(self.default_timeout_secs)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS as i64,
        }
    }
}

/// Emitter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// How long `enqueue` waits for the broker's confirmation.
    pub confirm_timeout_ms: u64,
}

impl EmitterConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT_MS,
        }
    }
}

/// Consumer handler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Whether RPC handlers delete their request queue when closed.
    pub delete_queue_on_close: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            delete_queue_on_close: true,
        }
    }
}

/// Seconds to a timeout, mapping `<= 0` to [`DEFAULT_RPC_TIMEOUT_SECS`].
pub fn effective_timeout_secs(secs: i64) -> Duration {
    match u64::try_from(secs) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
    }
}
