use courier_crypto::CryptoRegistry;
use courier_error::CourierError;
use courier_types::settings::{TransportKind, TransportSettings};
use serde::{Deserialize, Serialize};
use std::{path::Path, str::FromStr};

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Fallback tracing filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub transport: TransportSettings,
}

impl RuntimeConfig {
    pub fn new(transport: TransportSettings) -> Self {
        Self {
            log_level: default_log_level(),
            transport,
        }
    }

    /// Load the runtime config from a file
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CourierError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CourierError::ConfigError(format!("Unable to read {}: {e}", path.display()))
        })?;
        Self::from_str(&content)
    }

    /// Checks that the selected backend is configured and the crypto
    /// section is usable.
    pub fn validate(&self) -> Result<(), CourierError> {
        let transport = &self.transport;
        if transport.default_timeout_ms == 0 {
            return Err(CourierError::ConfigError(
                "transport.default_timeout_ms must be greater than zero".to_string(),
            ));
        }

        match transport.kind {
            TransportKind::Local => {}
            TransportKind::Http => {
                let http = transport.http.as_ref().ok_or_else(|| {
                    CourierError::ConfigError("transport.http is required for type http".into())
                })?;
                if !(http.base_url.starts_with("http://") || http.base_url.starts_with("https://"))
                {
                    return Err(CourierError::ConfigError(format!(
                        "transport.http.base_url must be an http(s) url, got {:?}",
                        http.base_url
                    )));
                }
            }
            TransportKind::Amqp => {
                let amqp = transport.amqp.as_ref().ok_or_else(|| {
                    CourierError::ConfigError("transport.amqp is required for type amqp".into())
                })?;
                if !(amqp.url.starts_with("amqp://") || amqp.url.starts_with("amqps://")) {
                    return Err(CourierError::ConfigError(format!(
                        "transport.amqp.url must be an amqp(s) url, got {:?}",
                        amqp.url
                    )));
                }
                if amqp.queue_prefix.trim().is_empty() {
                    return Err(CourierError::ConfigError(
                        "transport.amqp.queue_prefix must not be empty".to_string(),
                    ));
                }
            }
        }

        if let Some(crypto) = &transport.crypto {
            CryptoRegistry::with_defaults()
                .get(&crypto.algorithm)
                .map_err(|e| CourierError::ConfigError(e.to_string()))?;
            if crypto.private_key.is_some() != crypto.public_key.is_some() {
                return Err(CourierError::ConfigError(
                    "transport.crypto needs both private_key and public_key to sign".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl FromStr for RuntimeConfig {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml_ng::from_str(s).map_err(|e| CourierError::ConfigError(e.to_string()))
    }
}
