use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ERROR_CODE: i64 = -1000;

pub const TIMEOUT_ERROR_CODE: i64 = 5001;
pub const CONNECTION_ERROR_CODE: i64 = 5002;
pub const WAIT_EXCEED_ERROR_CODE: i64 = 5003;
pub const INVALID_DATA_ERROR_CODE: i64 = 5004;
pub const SEND_ERROR_CODE: i64 = 5005;
pub const CRYPTO_ERROR_CODE: i64 = 5006;
pub const UNSUPPORTED_ERROR_CODE: i64 = 5007;

/// Uniform error shape carried on the wire and surfaced to callers,
/// whatever backend produced it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message} ({code})")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Returns `true` when `value` looks like an error object:
    /// a JSON object with an integer `code` and a string `message`.
    pub fn is_error_object(value: &Value) -> bool {
        match value {
            Value::Object(map) => {
                map.get("code").map(Value::is_i64).unwrap_or(false)
                    && map.get("message").map(Value::is_string).unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        if !Self::is_error_object(value) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl Default for ErrorObject {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_CODE, "Unknown error")
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no connection: {0}")]
    Connection(String),

    #[error("{name} ({id}) is timed out after {timeout:?}")]
    Timeout {
        name: String,
        id: String,
        timeout: Duration,
    },

    /// A deferred command ran out of redeliveries or time.
    #[error("{name} ({id}) wait timeout or count exceeded")]
    WaitExceed { name: String, id: String },

    #[error("command execution failed: {0}")]
    Execution(ErrorObject),

    #[error("invalid data: {message}")]
    InvalidData {
        message: String,
        details: Option<String>,
    },

    #[error("unable to send: {0}")]
    Send(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

impl TransportError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_data_with(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Connection(_) => CONNECTION_ERROR_CODE,
            Self::Timeout { .. } => TIMEOUT_ERROR_CODE,
            Self::WaitExceed { .. } => WAIT_EXCEED_ERROR_CODE,
            Self::Execution(object) => object.code,
            Self::InvalidData { .. } => INVALID_DATA_ERROR_CODE,
            Self::Send(_) => SEND_ERROR_CODE,
            Self::Crypto(_) => CRYPTO_ERROR_CODE,
            Self::Unsupported(_) => UNSUPPORTED_ERROR_CODE,
        }
    }

    /// Normalizes the error into the wire shape. Execution errors are
    /// passed through untouched.
    pub fn to_object(&self) -> ErrorObject {
        match self {
            Self::Execution(object) => object.clone(),
            Self::InvalidData {
                message,
                details: Some(details),
            } => ErrorObject::new(self.code(), message.clone())
                .with_details(Value::String(details.clone())),
            Self::InvalidData { message, .. } => ErrorObject::new(self.code(), message.clone()),
            other => ErrorObject::new(other.code(), other.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<ErrorObject> for TransportError {
    fn from(object: ErrorObject) -> Self {
        Self::Execution(object)
    }
}

#[derive(Error, Debug, Clone)]
pub enum CourierError {
    #[error("Failed to parse configuration: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_object_omits_missing_details() {
        let object = ErrorObject::new(404, "Not found");
        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(value, json!({ "code": 404, "message": "Not found" }));
    }

    #[test]
    fn recognizes_error_object_shape() {
        assert!(ErrorObject::is_error_object(
            &json!({ "code": 1, "message": "boom", "details": { "a": 1 } })
        ));
        assert!(!ErrorObject::is_error_object(&json!({ "code": "1", "message": "boom" })));
        assert!(!ErrorObject::is_error_object(&json!(404)));
    }

    #[test]
    fn execution_error_passes_object_through() {
        let object = ErrorObject::new(42, "handler failed").with_details(json!({ "field": "x" }));
        let err = TransportError::from(object.clone());
        assert_eq!(err.code(), 42);
        assert_eq!(err.to_object(), object);
    }

    #[test]
    fn transport_errors_normalize_with_their_codes() {
        let timeout = TransportError::Timeout {
            name: "ping".into(),
            id: "1".into(),
            timeout: Duration::from_millis(100),
        };
        assert_eq!(timeout.to_object().code, TIMEOUT_ERROR_CODE);
        assert!(timeout.is_timeout());

        let invalid = TransportError::invalid_data_with("Invalid payload", "{oops");
        let object = invalid.to_object();
        assert_eq!(object.code, INVALID_DATA_ERROR_CODE);
        assert_eq!(object.message, "Invalid payload");
        assert_eq!(object.details, Some(json!("{oops")));

        let connection = TransportError::Connection("closed".into());
        assert_eq!(connection.to_object().code, CONNECTION_ERROR_CODE);

        let exceeded = TransportError::WaitExceed {
            name: "mint".into(),
            id: "7".into(),
        };
        let object = exceeded.to_object();
        assert_eq!(object.code, WAIT_EXCEED_ERROR_CODE);
        assert_eq!(object.message, "mint (7) wait timeout or count exceeded");
    }
}
