use crate::command::{Command, CommandOptions, TransportEvent};
use async_trait::async_trait;
use courier_error::{ErrorObject, TransportError};
use futures::{
    Stream,
    future::{BoxFuture, Shared},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

/// Reply of a command still in flight. Cloneable, so every waiter observes
/// the same single settlement.
pub type PendingReply = Shared<BoxFuture<'static, Result<Value, TransportError>>>;

/// Routes a completion back through the backend that delivered the command.
#[async_trait]
pub trait CommandResponder: Send + Sync {
    async fn respond(&self, command: &Command, result: Result<Value, ErrorObject>);

    async fn defer(&self, command: &Command) -> Result<(), TransportError>;
}

/// A command received by a listener, together with its way back to the sender.
pub struct IncomingCommand {
    command: Command,
    options: CommandOptions,
    responder: Arc<dyn CommandResponder>,
}

impl IncomingCommand {
    pub fn new(
        command: Command,
        options: CommandOptions,
        responder: Arc<dyn CommandResponder>,
    ) -> Self {
        Self {
            command,
            options,
            responder,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    pub fn request(&self) -> &Value {
        self.command.request()
    }

    pub fn request_as<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        self.command.request_as()
    }

    pub async fn complete(self, response: Value) {
        self.finish(Ok(response)).await
    }

    pub async fn complete_with<T: Serialize>(self, response: &T) {
        match serde_json::to_value(response) {
            Ok(value) => self.finish(Ok(value)).await,
            Err(err) => {
                let error = TransportError::invalid_data(format!(
                    "Unable to serialize \"{}\" response: {err}",
                    self.command.name()
                ));
                self.finish(Err(error.to_object())).await
            }
        }
    }

    pub async fn error(self, error: impl Into<ErrorObject>) {
        self.finish(Err(error.into())).await
    }

    pub async fn finish(self, result: Result<Value, ErrorObject>) {
        self.responder.respond(&self.command, result).await
    }

    /// Hands the command back to the transport to be delivered again after
    /// the command's wait delay. Once the wait limits are used up the
    /// command completes with a `WaitExceed` error instead.
    pub async fn defer(self) -> Result<(), TransportError> {
        self.responder.defer(&self.command).await
    }
}

impl fmt::Debug for IncomingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCommand")
            .field("command", &self.command)
            .field("options", &self.options)
            .finish()
    }
}

/// Commands delivered to one `listen` call.
#[derive(Debug)]
pub struct CommandStream {
    receiver: mpsc::UnboundedReceiver<IncomingCommand>,
}

impl CommandStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<IncomingCommand>) -> Self {
        Self { receiver }
    }

    pub fn channel() -> (mpsc::UnboundedSender<IncomingCommand>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self::new(receiver))
    }

    pub async fn next_command(&mut self) -> Option<IncomingCommand> {
        self.receiver.recv().await
    }
}

impl Stream for CommandStream {
    type Item = IncomingCommand;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream {
    pub fn channel() -> (mpsc::UnboundedSender<TransportEvent>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { receiver })
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.receiver.recv().await
    }
}

impl Stream for EventStream {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Backend-agnostic command routing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget. Returns once the backend accepted the command.
    async fn send(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<(), TransportError>;

    /// Dispatches the command and resolves with the handler's response.
    async fn send_listen(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<Value, TransportError>;

    async fn listen(&self, name: &str) -> Result<CommandStream, TransportError>;

    /// Completes a received command. Only the first completion per id is honoured.
    async fn complete(&self, command: &Command, result: Result<Value, ErrorObject>);

    fn wait(&self, id: &str) -> Option<PendingReply>;

    /// Schedules a received command for redelivery to its listener.
    async fn defer(&self, command: &Command) -> Result<(), TransportError>;

    async fn dispatch(&self, event: TransportEvent) -> Result<(), TransportError>;

    async fn events(&self, name: &str) -> Result<EventStream, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportExt: Transport {
    async fn send_listen_as<V>(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<V, TransportError>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let name = command.name().to_string();
        let value = self.send_listen(command, options).await?;
        serde_json::from_value(value.clone()).map_err(|err| {
            TransportError::invalid_data_with(
                format!("Invalid \"{name}\" response: {err}"),
                value.to_string(),
            )
        })
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}
