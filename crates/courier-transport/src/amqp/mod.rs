mod lapin_link;
mod link;

pub use lapin_link::LapinConnector;
pub use link::{
    AckMode, AmqpConnector, AmqpLink, AmqpSession, ExchangeType, InboundMessage, OutboundMessage,
};

use crate::{
    received::{Received, ReceivedRequests, SWEEP_INTERVAL},
    shared::TransportCore,
};
use async_trait::async_trait;
use courier_error::{ErrorObject, TransportError};
use courier_types::{
    Command, CommandOptions, CommandResponder, CommandStream, EventStream, IncomingCommand,
    PendingReply, Transport, TransportEvent,
    protocol::{
        RequestEnvelope, ResponseEnvelope, decode_event, decode_request, decode_response,
        encode_event, encode_request, encode_response,
    },
    settings::AmqpSettings,
};
use dashmap::{DashMap, DashSet};
use futures::{StreamExt, stream::BoxStream};
use serde_json::Value;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock, mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REPLY_QUEUE: &str = "QUEUE_REPLY";
const EVENT_EXCHANGE: &str = "EXCHANGE_EVENT";
const WAIT_QUEUE: &str = "QUEUE_WAIT";
const WAIT_EXCHANGE: &str = "EXCHANGE_WAIT";
const DEAD_EXCHANGE: &str = "EXCHANGE_DEAD";

/// Where the answer to a received command goes: `(reply_to, correlation_id)`.
type ReplyRoute = (String, String);

struct AmqpDelivery {
    route: Option<ReplyRoute>,
    delivery_tag: Option<u64>,
}

/// Commands over an AMQP 0.9.1 broker. Each command name maps to a queue,
/// replies come back on a per-instance exclusive queue and events go
/// through one fanout exchange.
///
/// Deferred commands are parked in a per-delay wait queue whose messages
/// expire into a direct dead-letter exchange, which routes them back to
/// their command queue.
#[derive(Clone)]
pub struct AmqpTransport {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    core: TransportCore,
    settings: AmqpSettings,
    connector: Arc<dyn AmqpConnector>,
    reply_queue: String,
    link: RwLock<Option<Arc<dyn AmqpLink>>>,
    generation: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    consuming_events: AtomicBool,
    listeners: DashMap<String, mpsc::UnboundedSender<IncomingCommand>>,
    requests: ReceivedRequests<AmqpDelivery>,
    events: DashMap<String, Vec<mpsc::UnboundedSender<TransportEvent>>>,
    declared: DashSet<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct AmqpResponder {
    inner: Weak<AmqpInner>,
}

#[async_trait]
impl CommandResponder for AmqpResponder {
    async fn respond(&self, command: &Command, result: Result<Value, ErrorObject>) {
        match self.inner.upgrade() {
            Some(inner) => inner.complete(command, result).await,
            None => debug!(id = command.id(), "transport dropped before completion"),
        }
    }

    async fn defer(&self, command: &Command) -> Result<(), TransportError> {
        match self.inner.upgrade() {
            Some(inner) => inner.defer(command).await,
            None => Err(TransportError::Connection("transport is closed".to_string())),
        }
    }
}

impl AmqpTransport {
    pub async fn connect(settings: AmqpSettings, core: TransportCore) -> Result<Self, TransportError> {
        let connector = Arc::new(LapinConnector::new(settings.url.clone(), settings.prefetch));
        Self::with_connector(settings, core, connector).await
    }

    pub async fn with_connector(
        settings: AmqpSettings,
        core: TransportCore,
        connector: Arc<dyn AmqpConnector>,
    ) -> Result<Self, TransportError> {
        let uid = Uuid::new_v4().simple().to_string();
        let reply_queue = format!("{}.{REPLY_QUEUE}.{uid}", settings.queue_prefix);

        let inner = Arc::new(AmqpInner {
            core,
            settings,
            connector,
            reply_queue,
            link: RwLock::new(None),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consuming_events: AtomicBool::new(false),
            listeners: DashMap::new(),
            requests: ReceivedRequests::default(),
            events: DashMap::new(),
            declared: DashSet::new(),
            tasks: Mutex::new(Vec::new()),
        });
        inner.establish().await?;
        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn queue_name(&self, name: &str) -> String {
        self.inner.queue_name(name)
    }

    /// `(exchange, queue)` that hold commands deferred by `delay`.
    pub fn wait_names(&self, delay: Duration) -> (String, String) {
        self.inner.wait_names(delay)
    }

    /// Received commands still waiting for completion.
    pub fn received_len(&self) -> usize {
        self.inner.requests.len()
    }
}

impl AmqpInner {
    fn queue_name(&self, name: &str) -> String {
        format!("{}.{name}", self.settings.queue_prefix)
    }

    fn event_exchange(&self) -> String {
        format!("{}.{EVENT_EXCHANGE}", self.settings.queue_prefix)
    }

    fn dead_exchange(&self) -> String {
        format!("{}.{DEAD_EXCHANGE}", self.settings.queue_prefix)
    }

    fn wait_names(&self, delay: Duration) -> (String, String) {
        let prefix = &self.settings.queue_prefix;
        let delay = delay.as_millis();
        (
            format!("{prefix}.{WAIT_EXCHANGE}.{delay}"),
            format!("{prefix}.{WAIT_QUEUE}.{delay}"),
        )
    }

    /// The live broker link; fails fast while disconnected.
    async fn link(&self) -> Result<Arc<dyn AmqpLink>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Connection("transport is closed".to_string()));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Connection(
                "not connected to AMQP broker".to_string(),
            ));
        }
        self.link
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Connection("not connected to AMQP broker".to_string()))
    }

    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let max_attempts = self.settings.reconnect_max_attempts.max(1);
        let delay = self.settings.reconnect_delay();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.open_session().await {
                Ok(()) => {
                    info!(attempt, reply_queue = %self.reply_queue, "connected to AMQP broker");
                    return Ok(());
                }
                Err(err) if attempt < max_attempts && !self.closed.load(Ordering::Acquire) => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "AMQP connection failed, retrying"
                    );
                    time::sleep(delay).await;
                }
                Err(err) => {
                    error!(attempt, error = %err, "unable to connect to AMQP broker");
                    return Err(err);
                }
            }
        }
    }

    async fn open_session(self: &Arc<Self>) -> Result<(), TransportError> {
        let AmqpSession { link, closed } = self.connector.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.declared.clear();
        self.consuming_events.store(false, Ordering::Release);

        let mut tasks = Vec::new();
        if let Err(err) = self.bind_session(&link, &mut tasks).await {
            for task in tasks {
                task.abort();
            }
            link.close().await;
            return Err(err);
        }

        *self.link.write().await = Some(link);
        self.connected.store(true, Ordering::Release);
        tasks.push(self.spawn_watcher(generation, closed));
        tasks.push(self.spawn_sweeper());
        self.tasks.lock().await.extend(tasks);
        Ok(())
    }

    /// Reply queue first, then every queue and exchange this instance
    /// already listens on.
    async fn bind_session(
        self: &Arc<Self>,
        link: &Arc<dyn AmqpLink>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), TransportError> {
        link.declare_reply_queue(&self.reply_queue).await?;
        let replies = link.consume(&self.reply_queue, AckMode::Auto).await?;
        tasks.push(self.spawn_reply_consumer(replies));

        let names: Vec<String> = self
            .listeners
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            tasks.push(self.bind_listener(link, &name).await?);
            debug!(command = %name, "listener re-bound");
        }

        if !self.events.is_empty() {
            tasks.push(self.bind_events(link).await?);
            self.consuming_events.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        generation: u64,
        closed: oneshot::Receiver<String>,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = closed
                .await
                .unwrap_or_else(|_| "connection dropped".to_string());
            if let Some(inner) = inner.upgrade() {
                inner.handle_disconnect(generation, reason);
            }
        })
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
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
                inner.reject_pruned(inner.requests.prune_expired()).await;
            }
        })
    }

    fn spawn_reply_consumer(
        self: &Arc<Self>,
        mut replies: BoxStream<'static, InboundMessage>,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(message) = replies.next().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_reply(message);
            }
        })
    }

    async fn bind_listener(
        self: &Arc<Self>,
        link: &Arc<dyn AmqpLink>,
        name: &str,
    ) -> Result<JoinHandle<()>, TransportError> {
        let queue = self.queue_name(name);
        self.ensure_queue(link, &queue).await?;
        let mut messages = link.consume(&queue, AckMode::Manual).await?;

        let inner = Arc::downgrade(self);
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_request(&name, message).await;
            }
            debug!(command = %name, "command consumer stopped");
        }))
    }

    async fn bind_events(
        self: &Arc<Self>,
        link: &Arc<dyn AmqpLink>,
    ) -> Result<JoinHandle<()>, TransportError> {
        let exchange = self.event_exchange();
        self.ensure_exchange(link, &exchange, ExchangeType::Fanout)
            .await?;
        let mut payloads = link.consume_exchange(&exchange).await?;

        let inner = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(payload) = payloads.next().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_event(&payload);
            }
        }))
    }

    /// Declares a command queue and binds it to the dead-letter exchange
    /// so expired wait-queue messages find their way back.
    async fn ensure_queue(&self, link: &Arc<dyn AmqpLink>, queue: &str) -> Result<(), TransportError> {
        if self.declared.contains(queue) {
            return Ok(());
        }
        let dead_exchange = self.dead_exchange();
        self.ensure_exchange(link, &dead_exchange, ExchangeType::Direct)
            .await?;
        link.declare_queue(queue).await?;
        link.bind_queue(queue, &dead_exchange, queue).await?;
        self.declared.insert(queue.to_string());
        Ok(())
    }

    async fn ensure_exchange(
        &self,
        link: &Arc<dyn AmqpLink>,
        exchange: &str,
        kind: ExchangeType,
    ) -> Result<(), TransportError> {
        if self.declared.contains(exchange) {
            return Ok(());
        }
        link.declare_exchange(exchange, kind).await?;
        self.declared.insert(exchange.to_string());
        Ok(())
    }

    /// Wait exchange for `delay`, returned once its queue is bound.
    async fn ensure_wait(
        &self,
        link: &Arc<dyn AmqpLink>,
        delay: Duration,
    ) -> Result<String, TransportError> {
        let (exchange, queue) = self.wait_names(delay);
        if self.declared.contains(&queue) {
            return Ok(exchange);
        }
        let dead_exchange = self.dead_exchange();
        self.ensure_exchange(link, &dead_exchange, ExchangeType::Direct)
            .await?;
        self.ensure_exchange(link, &exchange, ExchangeType::Fanout)
            .await?;
        link.declare_wait_queue(&queue, delay, &dead_exchange).await?;
        link.bind_queue(&queue, &exchange, "").await?;
        self.declared.insert(queue);
        Ok(exchange)
    }

    async fn ack(&self, delivery_tag: Option<u64>) {
        let Some(tag) = delivery_tag else {
            return;
        };
        match self.link().await {
            Ok(link) => {
                if let Err(err) = link.ack(tag).await {
                    warn!(delivery_tag = tag, error = %err, "unable to ack command");
                }
            }
            Err(err) => debug!(delivery_tag = tag, error = %err, "ack skipped"),
        }
    }

    async fn reject(&self, delivery_tag: Option<u64>) {
        let Some(tag) = delivery_tag else {
            return;
        };
        match self.link().await {
            Ok(link) => {
                if let Err(err) = link.reject(tag).await {
                    warn!(delivery_tag = tag, error = %err, "unable to reject command");
                }
            }
            Err(err) => debug!(delivery_tag = tag, error = %err, "reject skipped"),
        }
    }

    async fn reject_pruned(&self, pruned: Vec<(String, Received<AmqpDelivery>)>) {
        if pruned.is_empty() {
            return;
        }
        debug!(pruned = pruned.len(), "expired received commands pruned");
        for (_, request) in pruned {
            self.reject(request.delivery.delivery_tag).await;
        }
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: String) {
        if self.closed.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
            || !self.connected.swap(false, Ordering::AcqRel)
        {
            return;
        }

        error!(reason = %reason, "AMQP connection lost");
        let error = TransportError::Connection(format!("AMQP connection lost: {reason}"));
        self.core.fail_all(&error);
        self.requests.clear();

        if self.settings.auto_reconnect {
            let inner = self.clone();
            tokio::spawn(async move { inner.reconnect().await });
        }
    }

    async fn reconnect(self: Arc<Self>) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(link) = self.link.write().await.take() {
            link.close().await;
        }

        time::sleep(self.settings.reconnect_delay()).await;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.establish().await {
            error!(error = %err, "giving up on AMQP reconnection");
        }
    }

    async fn publish_request(
        &self,
        envelope: &RequestEnvelope,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let link = self.link().await?;
        let queue = self.queue_name(&envelope.name);
        self.ensure_queue(&link, &queue).await?;
        let payload = encode_request(envelope)?;

        debug!(command = %envelope.name, id = %envelope.id, queue = %queue, "publishing command");
        link.publish(OutboundMessage {
            exchange: String::new(),
            routing_key: queue,
            payload,
            correlation_id: Some(envelope.id.clone()),
            reply_to: envelope.is_need_reply.then(|| self.reply_queue.clone()),
            expiration: Some(timeout),
        })
        .await
    }

    async fn publish_response(
        &self,
        route: ReplyRoute,
        response: &ResponseEnvelope,
    ) -> Result<(), TransportError> {
        let (reply_to, correlation_id) = route;
        let link = self.link().await?;
        let payload = encode_response(response)?;
        link.publish(OutboundMessage {
            exchange: String::new(),
            routing_key: reply_to,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            expiration: None,
        })
        .await
    }

    async fn reply_error(&self, route: Option<ReplyRoute>, error: TransportError) {
        let Some(route) = route else {
            return;
        };
        let response = ResponseEnvelope::from_result(route.1.clone(), Err(error.to_object()));
        if let Err(err) = self.publish_response(route, &response).await {
            error!(id = %response.id, error = %err, "unable to send error response");
        }
    }

    fn handle_reply(&self, message: InboundMessage) {
        let response = match decode_response(&message.payload) {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "invalid response received, dropping it");
                return;
            }
        };
        if let Some(correlation_id) = &message.correlation_id {
            if correlation_id != &response.id {
                warn!(
                    id = %response.id,
                    correlation_id = %correlation_id,
                    "response id does not match its correlation id"
                );
            }
        }

        let id = response.id.clone();
        debug!(id = %id, "response received");
        self.core
            .settle(&id, response.into_result().map_err(TransportError::Execution));
    }

    async fn handle_request(self: &Arc<Self>, listener: &str, message: InboundMessage) {
        let tag = message.delivery_tag;
        let route = message.reply_to.clone().zip(message.correlation_id.clone());

        let envelope = match decode_request(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = TransportError::from(err);
                error!(command = %listener, error = %err, "invalid command received");
                self.reject(tag).await;
                self.reply_error(route, err).await;
                return;
            }
        };

        if envelope.is_need_reply && route.is_none() {
            let err = TransportError::invalid_data(format!(
                "\"{}\" command needs a reply but carries no correlation id or reply queue",
                envelope.name
            ));
            error!(command = %envelope.name, id = %envelope.id, error = %err, "dropping command");
            self.reject(tag).await;
            return;
        }
        if envelope.is_expired() {
            warn!(command = %envelope.name, id = %envelope.id, "command expired before delivery, dropping it");
            self.reject(tag).await;
            return;
        }
        let remaining = envelope
            .remaining()
            .unwrap_or_else(|| self.core.default_timeout());

        let (command, options) = match self.core.accept_request(envelope.clone()) {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(command = %listener, error = %err, "command rejected");
                self.reject(tag).await;
                self.reply_error(route, err).await;
                return;
            }
        };

        let Some(sender) = self.listeners.get(listener).map(|sender| sender.clone()) else {
            warn!(command = %command.name(), id = command.id(), "no listener for command");
            self.reject(tag).await;
            return;
        };

        self.reject_pruned(self.requests.prune_if_crowded()).await;

        let id = command.id().to_string();
        self.requests.insert(
            id.clone(),
            Received::new(
                envelope,
                remaining,
                AmqpDelivery {
                    route,
                    delivery_tag: tag,
                },
            ),
        );

        debug!(command = %command.name(), id = %id, "delivering command");
        let responder = Arc::new(AmqpResponder {
            inner: Arc::downgrade(self),
        });
        if sender
            .send(IncomingCommand::new(command, options, responder))
            .is_err()
        {
            warn!(command = %listener, id = %id, "listener is gone, dropping command");
            if let Some(request) = self.requests.remove(&id) {
                self.reject(request.delivery.delivery_tag).await;
            }
        }
    }

    fn handle_event(&self, payload: &[u8]) {
        let event = match decode_event(payload) {
            Ok(event) => event,
            Err(err) => {
                error!(error = %err, "invalid event received, dropping it");
                return;
            }
        };
        if let Some(mut subscribers) = self.events.get_mut(&event.name) {
            subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }

    async fn complete(&self, command: &Command, result: Result<Value, ErrorObject>) {
        let Some(request) = self.requests.remove(command.id()) else {
            warn!(
                command = %command.name(),
                id = command.id(),
                "command is already completed or unknown"
            );
            return;
        };
        self.finish(command, request, result).await;
    }

    /// Acknowledges the delivery, then replies when the sender still waits.
    async fn finish(
        &self,
        command: &Command,
        request: Received<AmqpDelivery>,
        result: Result<Value, ErrorObject>,
    ) {
        self.ack(request.delivery.delivery_tag).await;

        if !request.is_need_reply() {
            debug!(command = %command.name(), id = command.id(), "command does not need a reply");
            return;
        }
        if request.is_expired(Instant::now()) {
            warn!(command = %command.name(), id = command.id(), "command expired before completion");
            return;
        }
        let Some(route) = request.delivery.route else {
            return;
        };

        let response = ResponseEnvelope::from_result(command.id(), result);
        if let Err(err) = self.publish_response(route, &response).await {
            error!(
                command = %command.name(),
                id = command.id(),
                error = %err,
                "unable to send response"
            );
        }
    }

    async fn defer(&self, command: &Command) -> Result<(), TransportError> {
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
            self.finish(command, request, Err(error.to_object())).await;
            return Ok(());
        }

        let envelope = request.envelope.deferred();
        let delay = envelope.options.wait_delay_or_default();
        if let Err(err) = self.publish_deferred(&envelope, &request.delivery, delay).await {
            let id = command.id().to_string();
            self.requests.insert(id, request);
            return Err(err);
        }
        debug!(
            command = %command.name(),
            id = command.id(),
            wait_count = envelope.wait_count,
            delay_ms = delay.as_millis() as u64,
            "command deferred"
        );
        self.ack(request.delivery.delivery_tag).await;
        Ok(())
    }

    /// Parks the envelope in the wait queue for `delay`. The reply route
    /// travels in the message properties, as on the first delivery.
    async fn publish_deferred(
        &self,
        envelope: &RequestEnvelope,
        delivery: &AmqpDelivery,
        delay: Duration,
    ) -> Result<(), TransportError> {
        let link = self.link().await?;
        let exchange = self.ensure_wait(&link, delay).await?;
        let payload = encode_request(envelope)?;
        let (reply_to, correlation_id) = match &delivery.route {
            Some((reply_to, correlation_id)) => (Some(reply_to.clone()), correlation_id.clone()),
            None => (None, envelope.id.clone()),
        };

        link.publish(OutboundMessage {
            exchange,
            routing_key: self.queue_name(&envelope.name),
            payload,
            correlation_id: Some(correlation_id),
            reply_to,
            expiration: None,
        })
        .await
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn send(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<(), TransportError> {
        let mut command = command;
        command.mark_need_reply(false);
        let options = self.inner.core.options(options);
        let envelope = self.inner.core.request_envelope(&command, &options)?;
        let timeout = self.inner.core.timeout_for(&options);
        self.inner.publish_request(&envelope, timeout).await
    }

    async fn send_listen(
        &self,
        command: Command,
        options: Option<CommandOptions>,
    ) -> Result<Value, TransportError> {
        self.inner.link().await?;

        let mut command = command;
        command.mark_need_reply(true);
        let options = self.inner.core.options(options);
        let envelope = self.inner.core.request_envelope(&command, &options)?;
        let timeout = self.inner.core.timeout_for(&options);

        let inner = &self.inner;
        inner
            .core
            .send_listen(&command, &options, async move {
                inner.publish_request(&envelope, timeout).await
            })
            .await
    }

    async fn listen(&self, name: &str) -> Result<CommandStream, TransportError> {
        let link = self.inner.link().await?;
        let (sender, stream) = CommandStream::channel();
        if self
            .inner
            .listeners
            .insert(name.to_string(), sender)
            .is_some()
        {
            // the queue consumer looks the listener up per message
            warn!(command = name, "replacing existing listener");
            return Ok(stream);
        }

        match self.inner.bind_listener(&link, name).await {
            Ok(task) => self.inner.tasks.lock().await.push(task),
            Err(err) => {
                self.inner.listeners.remove(name);
                return Err(err);
            }
        }
        info!(command = name, queue = %self.inner.queue_name(name), "listening");
        Ok(stream)
    }

    async fn complete(&self, command: &Command, result: Result<Value, ErrorObject>) {
        self.inner.complete(command, result).await
    }

    fn wait(&self, id: &str) -> Option<PendingReply> {
        self.inner.core.wait(id)
    }

    async fn defer(&self, command: &Command) -> Result<(), TransportError> {
        self.inner.defer(command).await
    }

    async fn dispatch(&self, event: TransportEvent) -> Result<(), TransportError> {
        let link = self.inner.link().await?;
        let exchange = self.inner.event_exchange();
        self.inner
            .ensure_exchange(&link, &exchange, ExchangeType::Fanout)
            .await?;
        let payload = encode_event(&event)?;

        debug!(event = %event.name, exchange = %exchange, "dispatching event");
        link.publish(OutboundMessage {
            exchange,
            routing_key: String::new(),
            payload,
            correlation_id: None,
            reply_to: None,
            expiration: None,
        })
        .await
    }

    async fn events(&self, name: &str) -> Result<EventStream, TransportError> {
        let link = self.inner.link().await?;
        let (sender, stream) = EventStream::channel();
        self.inner
            .events
            .entry(name.to_string())
            .or_default()
            .push(sender);

        if !self.inner.consuming_events.swap(true, Ordering::AcqRel) {
            match self.inner.bind_events(&link).await {
                Ok(task) => self.inner.tasks.lock().await.push(task),
                Err(err) => {
                    self.inner.consuming_events.store(false, Ordering::Release);
                    return Err(err);
                }
            }
        }
        Ok(stream)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.connected.store(false, Ordering::Release);

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.listeners.clear();
        self.inner.events.clear();
        self.inner.requests.clear();
        self.inner
            .core
            .fail_all(&TransportError::Connection("transport is closed".to_string()));

        if let Some(link) = self.inner.link.write().await.take() {
            link.close().await;
        }
        info!("AMQP transport closed");
    }
}
