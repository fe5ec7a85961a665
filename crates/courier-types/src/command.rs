use courier_error::TransportError;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{fmt, time::Duration};
use uuid::Uuid;

/// A named, uniquely identified request. Correlation is always by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    id: String,
    name: String,
    #[serde(default)]
    request: Value,
    #[serde(default)]
    is_need_reply: bool,
}

impl Command {
    pub fn new(name: impl Into<String>, request: Value) -> Result<Self, TransportError> {
        Self::with_id(Uuid::new_v4().to_string(), name, request)
    }

    /// Command without a request payload.
    pub fn named(name: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(name, Value::Null)
    }

    pub fn from_request<T: Serialize>(
        name: impl Into<String>,
        request: &T,
    ) -> Result<Self, TransportError> {
        let request = serde_json::to_value(request).map_err(|err| {
            TransportError::invalid_data(format!("Unable to serialize request: {err}"))
        })?;
        Self::new(name, request)
    }

    /// Rebuilds a command with a known id, as the receiving side does.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        request: Value,
    ) -> Result<Self, TransportError> {
        let id = id.into();
        let name = name.into();
        if id.trim().is_empty() {
            return Err(TransportError::invalid_data("Command id is empty"));
        }
        if name.trim().is_empty() {
            return Err(TransportError::invalid_data("Command name is empty"));
        }
        Ok(Self {
            id,
            name,
            request,
            is_need_reply: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &Value {
        &self.request
    }

    pub fn request_as<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_value(self.request.clone()).map_err(|err| {
            TransportError::invalid_data_with(
                format!("Invalid \"{}\" command request: {err}", self.name),
                self.request.to_string(),
            )
        })
    }

    pub fn is_need_reply(&self) -> bool {
        self.is_need_reply
    }

    /// Set by transports: `send` dispatches one-way, `send_listen` expects a reply.
    pub fn mark_need_reply(&mut self, value: bool) {
        self.is_need_reply = value;
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Command {}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Delay before a deferred command is delivered again.
pub const DEFAULT_WAIT_DELAY: Duration = Duration::from_millis(3_000);

/// Redeliveries a deferred command gets before it fails with `WaitExceed`.
pub const DEFAULT_WAIT_MAX_COUNT: u32 = 5;

/// Per-send configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub is_need_signature: bool,
    /// Honoured by backends that can retry a failed dispatch (HTTP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, with = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub wait_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_max_count: Option<u32>,
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn signed(mut self) -> Self {
        self.is_need_signature = true;
        self
    }

    pub fn retry(mut self, attempts: u32) -> Self {
        self.retry = Some(attempts);
        self
    }

    /// How a deferred command is redelivered: every `delay`, at most
    /// `max_count` times.
    pub fn wait(mut self, delay: Duration, max_count: u32) -> Self {
        self.wait_delay = Some(delay);
        self.wait_max_count = Some(max_count);
        self
    }

    pub fn wait_delay_or_default(&self) -> Duration {
        self.wait_delay.unwrap_or(DEFAULT_WAIT_DELAY)
    }

    pub fn wait_max_count_or_default(&self) -> u32 {
        self.wait_max_count.unwrap_or(DEFAULT_WAIT_MAX_COUNT)
    }
}

/// Attached to a request envelope when the sender signs the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub value: String,
    pub nonce: String,
    pub public_key: String,
}

/// Broadcast notification; unlike a command it has no id and no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl TransportEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Result<Self, TransportError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TransportError::invalid_data("Event name is empty"));
        }
        Ok(Self { name, data })
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
