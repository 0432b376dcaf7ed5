//! Application configuration.
//!
//! Aggregates broker and pattern settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{
    effective_timeout_secs, AmqpConfig, EmitterConfig, HandlerConfig, RpcConfig,
    DEFAULT_CONFIRM_TIMEOUT_MS, DEFAULT_RPC_TIMEOUT_SECS,
};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "WARREN_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "WARREN";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "WARREN_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub amqp: AmqpConfig,
    pub rpc: RpcConfig,
    pub emitter: EmitterConfig,
    pub handlers: HandlerConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config.yaml` in the current directory (optional)
    /// 2. `path`, when given (required)
    /// 3. the file named by `WARREN_CONFIG`, when set (required)
    /// 4. `WARREN__SECTION__KEY` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
