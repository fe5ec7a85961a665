use async_trait::async_trait;
use courier_transport::{CommandHandler, HandlerError};
use serde_json::Value;

/// Replies with the request it was given.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    name: String,
}

impl EchoHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl CommandHandler for EchoHandler {
    type Request = Value;
    type Response = Value;

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: Value) -> Result<Value, HandlerError> {
        Ok(request)
    }
}
