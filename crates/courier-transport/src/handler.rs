use async_trait::async_trait;
use courier_error::{ErrorObject, TransportError};
use courier_types::{IncomingCommand, Transport};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    /// Not ready yet: deliver the command again after its wait delay.
    #[error("command deferred")]
    Defer,

    #[error(transparent)]
    Failed(#[from] ErrorObject),
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        Self::Failed(err.to_object())
    }
}

/// Typed handler for one command name.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send + Sync;

    fn name(&self) -> &str;

    async fn execute(&self, request: Self::Request) -> Result<Self::Response, HandlerError>;
}

/// Listens on the handler's command name and runs every received command in
/// its own task, so slow commands never hold back the ones behind them.
pub async fn serve<H: CommandHandler>(
    transport: Arc<dyn Transport>,
    handler: Arc<H>,
) -> Result<JoinHandle<()>, TransportError> {
    let mut commands = transport.listen(handler.name()).await?;
    info!(command = handler.name(), "serving command");

    Ok(tokio::spawn(async move {
        while let Some(incoming) = commands.next_command().await {
            let handler = handler.clone();
            tokio::spawn(handle(handler, incoming));
        }
        debug!(command = handler.name(), "command stream closed");
    }))
}

async fn handle<H: CommandHandler>(handler: Arc<H>, incoming: IncomingCommand) {
    let request = match incoming.request_as::<H::Request>() {
        Ok(request) => request,
        Err(err) => {
            warn!(
                command = handler.name(),
                id = incoming.command().id(),
                error = %err,
                "unable to decode command request"
            );
            incoming.error(err.to_object()).await;
            return;
        }
    };

    match handler.execute(request).await {
        Ok(response) => incoming.complete_with(&response).await,
        Err(HandlerError::Defer) => {
            let id = incoming.command().id().to_string();
            if let Err(err) = incoming.defer().await {
                warn!(command = handler.name(), id = %id, error = %err, "unable to defer command");
            }
        }
        Err(HandlerError::Failed(error)) => {
            debug!(
                command = handler.name(),
                id = incoming.command().id(),
                code = error.code,
                "command failed"
            );
            incoming.error(error).await
        }
    }
}
