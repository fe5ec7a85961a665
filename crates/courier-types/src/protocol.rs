use crate::command::{Command, CommandOptions, Signature, TransportEvent};
use courier_error::{DEFAULT_ERROR_CODE, ErrorObject, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const CONTENT_TYPE: &str = "application/json";
pub const CONTENT_ENCODING: &str = "utf-8";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub options: CommandOptions,
    #[serde(default)]
    pub is_need_reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    /// Milliseconds since the unix epoch at which the sender built the envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<u64>,
    /// Times the command has been deferred and delivered again
    #[serde(default, skip_serializing_if = "is_zero")]
    pub wait_count: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl RequestEnvelope {
    pub fn new(command: &Command, options: &CommandOptions) -> Self {
        Self {
            id: command.id().to_string(),
            name: command.name().to_string(),
            request: command.request().clone(),
            options: options.clone(),
            is_need_reply: command.is_need_reply(),
            signature: None,
            sent_at: Some(now_millis()),
            wait_count: 0,
        }
    }

    /// Whether one more deferral still fits within the wait limits and the
    /// time the sender is willing to wait.
    pub fn can_defer(&self) -> bool {
        if self.wait_count >= self.options.wait_max_count_or_default() {
            return false;
        }
        self.remaining()
            .is_none_or(|left| left > self.options.wait_delay_or_default())
    }

    /// The envelope to deliver on the next attempt.
    pub fn deferred(&self) -> Self {
        Self {
            wait_count: self.wait_count + 1,
            ..self.clone()
        }
    }

    /// Time left before the sender gives up, or `None` when the envelope
    /// carries no timeout. Zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let timeout = self.options.timeout?;
        let Some(sent_at) = self.sent_at else {
            return Some(timeout);
        };
        let elapsed = Duration::from_millis(now_millis().saturating_sub(sent_at));
        Some(timeout.saturating_sub(elapsed))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    pub fn to_command(&self) -> Result<Command, TransportError> {
        let mut command = Command::with_id(&self.id, &self.name, self.request.clone())?;
        command.mark_need_reply(self.is_need_reply);
        Ok(command)
    }
}

/// `{id, result}` on success, `{id, error}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResponseEnvelope {
    pub fn from_result(id: impl Into<String>, result: Result<Value, ErrorObject>) -> Self {
        match result {
            Ok(value) => Self {
                id: id.into(),
                result: Some(value),
                error: None,
            },
            Err(error) => Self {
                id: id.into(),
                result: None,
                error: Some(error),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(command: &Command) -> Self {
        Self {
            id: command.id().to_string(),
            method: command.name().to_string(),
            params: vec![command.request().clone()],
        }
    }
}

/// Inspects a response body for the RPC envelope `{id, result, error}`.
///
/// Returns `None` when the body does not have that shape, so the caller can
/// fall back to plain HTTP semantics.
pub fn parse_rpc_response(body: &Value) -> Option<Result<Value, ErrorObject>> {
    let map = body.as_object()?;
    if !map.contains_key("id") || !(map.contains_key("result") || map.contains_key("error")) {
        return None;
    }

    match map.get("error") {
        Some(error) if !error.is_null() => Some(Err(rpc_error_object(error, body))),
        _ => Some(Ok(map.get("result").cloned().unwrap_or(Value::Null))),
    }
}

fn rpc_error_object(error: &Value, body: &Value) -> ErrorObject {
    if let Some(code) = error.as_i64() {
        return ErrorObject::new(code, "Unknown error");
    }
    if let Some(object) = ErrorObject::from_value(error) {
        return object;
    }
    ErrorObject::new(DEFAULT_ERROR_CODE, "Unknown RPC error").with_details(body.clone())
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode json payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid payload: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        content: String,
    },
    #[error("payload is not valid utf-8")]
    Utf8,
    #[error("invalid message: {0} is empty")]
    MissingField(&'static str),
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match &err {
            ProtocolError::Decode { content, .. } => {
                TransportError::invalid_data_with(err.to_string(), content.clone())
            }
            _ => TransportError::invalid_data(err.to_string()),
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let content = std::str::from_utf8(bytes).map_err(|_| ProtocolError::Utf8)?;
    serde_json::from_str(content).map_err(|source| ProtocolError::Decode {
        source,
        content: content.to_string(),
    })
}

pub fn encode_request(request: &RequestEnvelope) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(request).map_err(ProtocolError::Encode)
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, ProtocolError> {
    let request: RequestEnvelope = decode(bytes)?;
    if request.id.trim().is_empty() {
        return Err(ProtocolError::MissingField("id"));
    }
    if request.name.trim().is_empty() {
        return Err(ProtocolError::MissingField("name"));
    }
    Ok(request)
}

pub fn encode_response(response: &ResponseEnvelope) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(response).map_err(ProtocolError::Encode)
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope, ProtocolError> {
    let response: ResponseEnvelope = decode(bytes)?;
    if response.id.trim().is_empty() {
        return Err(ProtocolError::MissingField("id"));
    }
    Ok(response)
}

pub fn encode_event(event: &TransportEvent) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(event).map_err(ProtocolError::Encode)
}

pub fn decode_event(bytes: &[u8]) -> Result<TransportEvent, ProtocolError> {
    let event: TransportEvent = decode(bytes)?;
    if event.name.trim().is_empty() {
        return Err(ProtocolError::MissingField("name"));
    }
    Ok(event)
}
