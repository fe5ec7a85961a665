use crate::{retry::RetryPolicy, shared::TransportCore};
use async_trait::async_trait;
use courier_error::{
    CONNECTION_ERROR_CODE, ErrorObject, INVALID_DATA_ERROR_CODE, TIMEOUT_ERROR_CODE,
    TransportError, UNSUPPORTED_ERROR_CODE,
};
use courier_types::{
    Command, CommandOptions, CommandStream, EventStream, PendingReply, Transport, TransportEvent,
    protocol::{RpcRequest, parse_rpc_response},
    settings::{HttpMethod, HttpSettings},
};
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

const HEADER_COMMAND_ID: &str = "x-courier-id";
const HEADER_SIGNATURE: &str = "x-courier-signature";
const HEADER_NONCE: &str = "x-courier-nonce";
const HEADER_PUBLIC_KEY: &str = "x-courier-public-key";

/// Maps an error object onto the status an HTTP-facing handler should answer with.
pub fn status_for_error(error: &ErrorObject) -> StatusCode {
    match error.code {
        code @ 400..=599 => {
            StatusCode::from_u16(code as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        TIMEOUT_ERROR_CODE => StatusCode::GATEWAY_TIMEOUT,
        CONNECTION_ERROR_CODE => StatusCode::SERVICE_UNAVAILABLE,
        INVALID_DATA_ERROR_CODE => StatusCode::BAD_REQUEST,
        UNSUPPORTED_ERROR_CODE => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// One outbound HTTP request per command, in plain REST or JSON-RPC shape.
pub struct HttpTransport {
    core: TransportCore,
    client: reqwest::Client,
    settings: HttpSettings,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(settings: HttpSettings, core: TransportCore) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (key, value) in &settings.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|err| {
                TransportError::invalid_data(format!("Invalid header name \"{key}\": {err}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                TransportError::invalid_data(format!("Invalid value for header \"{key}\": {err}"))
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| TransportError::Connection(err.to_string()))?;

        Ok(Self {
            core,
            client,
            retry: RetryPolicy::from_config(settings.retry.as_ref()),
            settings,
        })
    }

    fn url_for(&self, command: &Command) -> String {
        if self.settings.rpc {
            return self.settings.base_url.clone();
        }
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            command.name().trim_start_matches('/')
        )
    }

    fn method(&self) -> Method {
        if self.settings.rpc {
            return Method::POST;
        }
        match self.settings.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn build_request(
        &self,
        command: &Command,
        options: &CommandOptions,
        timeout: Duration,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = self.method();
        let mut request = self
            .client
            .request(method.clone(), self.url_for(command))
            .timeout(timeout)
            .header(HEADER_COMMAND_ID, command.id());

        request = if self.settings.rpc {
            request.json(&RpcRequest::new(command))
        } else if method == Method::GET || method == Method::DELETE {
            request.query(&query_pairs(command.request()))
        } else {
            request
                .header(CONTENT_TYPE, "application/json")
                .body(command.request().to_string())
        };

        if options.is_need_signature {
            let signature = self.core.sign(command)?;
            request = request
                .header(HEADER_SIGNATURE, signature.value)
                .header(HEADER_NONCE, signature.nonce)
                .header(HEADER_PUBLIC_KEY, signature.public_key.replace('\n', "\\n"));
        }
        Ok(request)
    }

    async fn call(
        &self,
        command: &Command,
        options: &CommandOptions,
    ) -> Result<Value, TransportError> {
        let timeout = self.core.timeout_for(options);
        let policy = self.retry.with_attempts(options.retry);
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let started = Instant::now();
            match self.call_once(command, options, timeout).await {
                Ok(value) => {
                    debug!(
                        command = %command.name(),
                        id = command.id(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "HTTP request succeeded"
                    );
                    return Ok(value);
                }
                Err(err) => {
                    if !policy.should_retry(attempt, &err) {
                        return Err(err);
                    }
                    let delay = policy.backoff_delay(attempt);
                    warn!(
                        command = %command.name(),
                        id = command.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying HTTP request"
                    );
                    time::sleep(delay).await;
                }
            }
        }
    }

    async fn call_once(
        &self,
        command: &Command,
        options: &CommandOptions,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let map_err = |err: reqwest::Error| -> TransportError {
            if err.is_timeout() {
                TransportError::Timeout {
                    name: command.name().to_string(),
                    id: command.id().to_string(),
                    timeout,
                }
            } else if err.is_connect() || err.is_request() {
                TransportError::Connection(err.to_string())
            } else {
                TransportError::Send(err.to_string())
            }
        };

        let response = self
            .build_request(command, options, timeout)?
            .send()
            .await
            .map_err(map_err)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_err)?;
        parse_response(status, &body, self.settings.rpc)
    }
}

/// Flattens an object request into query parameters. Strings are sent raw,
/// everything else as JSON.
fn query_pairs(request: &Value) -> Vec<(String, String)> {
    match request {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
        Value::String(text) => vec![("request".to_string(), text.clone())],
        other => vec![("request".to_string(), other.to_string())],
    }
}

pub(crate) fn parse_response(
    status: StatusCode,
    body: &[u8],
    rpc: bool,
) -> Result<Value, TransportError> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let value = if text.is_empty() {
        None
    } else {
        serde_json::from_str::<Value>(text).ok()
    };

    if !status.is_success() {
        let object = value
            .as_ref()
            .and_then(|body| {
                ErrorObject::from_value(body).or_else(|| match parse_rpc_response(body) {
                    Some(Err(object)) => Some(object),
                    _ => None,
                })
            })
            .unwrap_or_else(|| {
                let message = if text.is_empty() {
                    status.canonical_reason().unwrap_or("HTTP error").to_string()
                } else {
                    text.to_string()
                };
                ErrorObject::new(i64::from(status.as_u16()), message)
            });
        return Err(TransportError::Execution(object));
    }

    let Some(value) = value else {
        if text.is_empty() {
            return Ok(Value::Null);
        }
        return Ok(Value::String(text.to_string()));
    };

    match parse_rpc_response(&value) {
        Some(Err(object)) => Err(TransportError::Execution(object)),
        Some(Ok(result)) if rpc => Ok(result),
        _ => Ok(value),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<(), TransportError> {
        let mut command = command;
        command.mark_need_reply(false);
        let options = self.core.options(options);
        match self.call(&command, &options).await {
            Ok(_) => Ok(()),
            // delivered; the handler's answer is not the sender's concern
            Err(TransportError::Execution(error)) => {
                warn!(
                    command = %command.name(),
                    id = command.id(),
                    code = error.code,
                    error = %error.message,
                    "command failed on the receiving side"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn send_listen(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<Value, TransportError> {
        let mut command = command;
        command.mark_need_reply(true);
        let options = self.core.options(options);

        self.core
            .send_listen(&command, &options, async {
                let value = self.call(&command, &options).await?;
                self.core.settle(command.id(), Ok(value));
                Ok(())
            })
            .await
    }

    async fn listen(&self, _name: &str) -> Result<CommandStream, TransportError> {
        Err(TransportError::Unsupported("listen"))
    }

    async fn complete(&self, command: &Command, _result: Result<Value, ErrorObject>) {
        debug!(
            command = %command.name(),
            id = command.id(),
            "HTTP transport answers in-band, ignoring completion"
        );
    }

    fn wait(&self, id: &str) -> Option<PendingReply> {
        self.core.wait(id)
    }

    async fn defer(&self, _command: &Command) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("defer"))
    }

    async fn dispatch(&self, _event: TransportEvent) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("dispatch"))
    }

    async fn events(&self, _name: &str) -> Result<EventStream, TransportError> {
        Err(TransportError::Unsupported("events"))
    }

    async fn close(&self) {
        self.core
            .fail_all(&TransportError::Connection("transport is closed".to_string()));
    }
}
