//! Environment-driven configuration for the queue client and worker.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use dealq_core::{DomainError, TubeName};

use crate::queue::AckMode;
use crate::tarantool::ConnectOptions;
use crate::workers::DispatchConfig;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:3301";
pub const DEFAULT_TUBE: &str = "deals";
pub const DEFAULT_TAKE_TIMEOUT: Duration = Duration::from_secs(2);

pub const ENV_ADDRESS: &str = "DEALQ_TARANTOOL_ADDR";
pub const ENV_USER: &str = "DEALQ_TARANTOOL_USER";
pub const ENV_PASSWORD: &str = "DEALQ_TARANTOOL_PASSWORD";
pub const ENV_TUBE: &str = "DEALQ_TUBE";
pub const ENV_TAKE_TIMEOUT_MS: &str = "DEALQ_TAKE_TIMEOUT_MS";
pub const ENV_ACK_MODE: &str = "DEALQ_ACK_MODE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: {source}")]
    InvalidTube {
        var: &'static str,
        #[source]
        source: DomainError,
    },

    #[error("{var}={value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub address: String,
    pub tube: TubeName,
    pub connect: ConnectOptions,
    /// How long one `take` waits on the broker.
    pub take_timeout: Duration,
    pub ack_mode: AckMode,
    pub dispatch: DispatchConfig,
}

impl QueueConfig {
    pub fn new(address: impl Into<String>, tube: TubeName) -> Self {
        Self {
            address: address.into(),
            tube,
            connect: ConnectOptions::default(),
            take_timeout: DEFAULT_TAKE_TIMEOUT,
            ack_mode: AckMode::default(),
            dispatch: DispatchConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let address = get(ENV_ADDRESS).unwrap_or_else(|| {
            warn!("{} not set; using {}", ENV_ADDRESS, DEFAULT_ADDRESS);
            DEFAULT_ADDRESS.to_string()
        });

        let tube_raw = get(ENV_TUBE).unwrap_or_else(|| {
            warn!("{} not set; using {}", ENV_TUBE, DEFAULT_TUBE);
            DEFAULT_TUBE.to_string()
        });
        let tube = TubeName::parse(tube_raw.trim()).map_err(|source| ConfigError::InvalidTube {
            var: ENV_TUBE,
            source,
        })?;

        let mut config = Self::new(address, tube);

        if let Some(user) = get(ENV_USER) {
            let password = get(ENV_PASSWORD).unwrap_or_default();
            config.connect = config.connect.with_credentials(user, password);
        }

        if let Some(raw) = get(ENV_TAKE_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    var: ENV_TAKE_TIMEOUT_MS,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            config.take_timeout = Duration::from_millis(ms);
        }

        if let Some(raw) = get(ENV_ACK_MODE) {
            config.ack_mode = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                var: ENV_ACK_MODE,
                value: raw.clone(),
                reason,
            })?;
        }

        Ok(config)
    }
}
