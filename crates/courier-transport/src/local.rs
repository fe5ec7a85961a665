use crate::{
    received::{Received, ReceivedRequests, SWEEP_INTERVAL},
    shared::TransportCore,
};
use async_trait::async_trait;
use courier_error::{ErrorObject, TransportError};
use courier_types::{
    Command, CommandOptions, CommandResponder, CommandStream, EventStream, IncomingCommand,
    PendingReply, Transport, TransportEvent, protocol::RequestEnvelope,
};
use dashmap::DashMap;
use serde_json::Value;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

/// In-process transport. Listeners and senders share one instance.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    core: TransportCore,
    listeners: DashMap<String, mpsc::UnboundedSender<IncomingCommand>>,
    requests: ReceivedRequests<()>,
    events: DashMap<String, Vec<mpsc::UnboundedSender<TransportEvent>>>,
    closed: AtomicBool,
    sweeping: AtomicBool,
}

struct LocalResponder {
    inner: Weak<LocalInner>,
}

#[async_trait]
impl CommandResponder for LocalResponder {
    async fn respond(&self, command: &Command, result: Result<Value, ErrorObject>) {
        match self.inner.upgrade() {
            Some(inner) => inner.complete(command, result),
            None => debug!(id = command.id(), "transport dropped before completion"),
        }
    }

    async fn defer(&self, command: &Command) -> Result<(), TransportError> {
        match self.inner.upgrade() {
            Some(inner) => inner.defer(command),
            None => Err(TransportError::Connection("transport is closed".to_string())),
        }
    }
}

impl LocalTransport {
    pub fn new(core: TransportCore) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                core,
                listeners: DashMap::new(),
                requests: ReceivedRequests::default(),
                events: DashMap::new(),
                closed: AtomicBool::new(false),
                sweeping: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self::new(TransportCore::new(default_timeout))
    }

    /// Received commands still waiting for completion.
    pub fn received_len(&self) -> usize {
        self.inner.requests.len()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Connection("transport is closed".to_string()));
        }
        Ok(())
    }
}

impl LocalInner {
    fn deliver(self: &Arc<Self>, envelope: RequestEnvelope) -> Result<(), TransportError> {
        if envelope.is_expired() {
            warn!(command = %envelope.name, id = %envelope.id, "command expired before delivery, dropping it");
            return Ok(());
        }
        let remaining = envelope
            .remaining()
            .unwrap_or_else(|| self.core.default_timeout());
        let (command, options) = self.core.accept_request(envelope.clone())?;

        let Some(sender) = self
            .listeners
            .get(command.name())
            .map(|sender| sender.clone())
        else {
            warn!(command = %command.name(), id = command.id(), "no listener for command");
            return Ok(());
        };

        self.log_pruned(self.requests.prune_if_crowded().len());

        let id = command.id().to_string();
        let name = command.name().to_string();
        self.requests
            .insert(id.clone(), Received::new(envelope, remaining, ()));

        let responder = Arc::new(LocalResponder {
            inner: Arc::downgrade(self),
        });
        debug!(command = %name, id = %id, "delivering command");
        if sender
            .send(IncomingCommand::new(command, options, responder))
            .is_err()
        {
            warn!(command = %name, id = %id, "listener is gone, dropping command");
            self.requests.remove(&id);
            self.listeners.remove_if(&name, |_, sender| sender.is_closed());
        }
        Ok(())
    }

    fn log_pruned(&self, pruned: usize) {
        if pruned > 0 {
            debug!(pruned, "expired received commands pruned");
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.log_pruned(inner.requests.prune_expired().len());
            }
        });
    }

    fn complete(&self, command: &Command, result: Result<Value, ErrorObject>) {
        let Some(request) = self.requests.remove(command.id()) else {
            warn!(
                command = %command.name(),
                id = command.id(),
                "command is already completed or unknown"
            );
            return;
        };
        self.finish(command, request, result);
    }

    fn finish(&self, command: &Command, request: Received<()>, result: Result<Value, ErrorObject>) {
        if !request.is_need_reply() {
            debug!(command = %command.name(), id = command.id(), "command does not need a reply");
            return;
        }
        if request.is_expired(Instant::now()) {
            warn!(command = %command.name(), id = command.id(), "command expired before completion");
            return;
        }

        self.core
            .settle(command.id(), result.map_err(TransportError::Execution));
    }

    fn defer(self: &Arc<Self>, command: &Command) -> Result<(), TransportError> {
        let Some(request) = self.requests.remove(command.id()) else {
            return Err(TransportError::invalid_data(format!(
                "Unable to defer \"{}\" command: it is already completed or unknown",
                command.name()
            )));
        };

        if !request.envelope.can_defer() {
            warn!(
                command = %command.name(),
                id = command.id(),
                wait_count = request.envelope.wait_count,
                "command wait limit reached"
            );
            let error = TransportError::WaitExceed {
                name: command.name().to_string(),
                id: command.id().to_string(),
            };
            self.finish(command, request, Err(error.to_object()));
            return Ok(());
        }

        let envelope = request.envelope.deferred();
        let delay = envelope.options.wait_delay_or_default();
        debug!(
            command = %command.name(),
            id = command.id(),
            wait_count = envelope.wait_count,
            delay_ms = delay.as_millis() as u64,
            "deferring command"
        );

        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            if let Err(err) = inner.deliver(envelope) {
                warn!(error = %err, "unable to deliver deferred command");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut command = command;
        command.mark_need_reply(false);
        let options = self.inner.core.options(options);
        let envelope = self.inner.core.request_envelope(&command, &options)?;
        self.inner.deliver(envelope)
    }

    async fn send_listen(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<Value, TransportError> {
        self.ensure_open()?;
        let mut command = command;
        command.mark_need_reply(true);
        let options = self.inner.core.options(options);
        let envelope = self.inner.core.request_envelope(&command, &options)?;

        let inner = &self.inner;
        inner
            .core
            .send_listen(&command, &options, async move { inner.deliver(envelope) })
            .await
    }

    async fn listen(&self, name: &str) -> Result<CommandStream, TransportError> {
        self.ensure_open()?;
        let (sender, stream) = CommandStream::channel();
        if self.inner.listeners.insert(name.to_string(), sender).is_some() {
            warn!(command = name, "replacing existing listener");
        }
        self.inner.spawn_sweeper();
        Ok(stream)
    }

    async fn complete(&self, command: &Command, result: Result<Value, ErrorObject>) {
        self.inner.complete(command, result)
    }

    fn wait(&self, id: &str) -> Option<PendingReply> {
        self.inner.core.wait(id)
    }

    async fn defer(&self, command: &Command) -> Result<(), TransportError> {
        self.inner.defer(command)
    }

    async fn dispatch(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.ensure_open()?;
        match self.inner.events.get_mut(&event.name) {
            Some(mut subscribers) => {
                subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
            }
            None => debug!(event = %event.name, "no subscribers for event"),
        }
        Ok(())
    }

    async fn events(&self, name: &str) -> Result<EventStream, TransportError> {
        self.ensure_open()?;
        let (sender, stream) = EventStream::channel();
        self.inner
            .events
            .entry(name.to_string())
            .or_default()
            .push(sender);
        Ok(stream)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.listeners.clear();
        self.inner.events.clear();
        self.inner.requests.clear();
        self.inner
            .core
            .fail_all(&TransportError::Connection("transport is closed".to_string()));
        debug!("local transport closed");
    }
}
