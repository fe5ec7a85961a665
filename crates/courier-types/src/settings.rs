use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_queue_prefix() -> String {
    "courier".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_prefetch() -> u16 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Local,
    Http,
    Amqp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(rename = "type")]
    pub kind: TransportKind,

    /// Used when a command is sent without an explicit timeout
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default)]
    pub http: Option<HttpSettings>,

    #[serde(default)]
    pub amqp: Option<AmqpSettings>,

    #[serde(default)]
    pub crypto: Option<CryptoSettings>,
}

impl TransportSettings {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            http: None,
            amqp: None,
            crypto: None,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub base_url: String,

    /// Wrap commands in `{id, method, params}` and post them to `base_url`
    #[serde(default)]
    pub rpc: bool,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: Option<RetryPolicyConfig>,
}

impl HttpSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            rpc: false,
            method: HttpMethod::default(),
            headers: BTreeMap::new(),
            retry: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max: Option<u32>,
    pub backoff_ms_initial: Option<u64>,
    pub backoff_ms_max: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpSettings {
    pub url: String,

    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Reconnect in the background after the broker connection drops
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

impl AmqpSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue_prefix: default_queue_prefix(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            auto_reconnect: true,
            prefetch: default_prefetch(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSettings {
    /// Strategy name, e.g. `Ed25519` or `RSA`
    pub algorithm: String,

    #[serde(default)]
    pub private_key: Option<String>,

    #[serde(default)]
    pub public_key: Option<String>,

    /// Check signatures on incoming commands that carry one
    #[serde(default = "default_true")]
    pub verify_incoming: bool,

    /// Reject incoming commands without a signature
    #[serde(default)]
    pub require_signature: bool,
}
