use async_trait::async_trait;
use courier_error::TransportError;
use futures::stream::BoxStream;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Empty for the default exchange.
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Broker-side message TTL
    pub expiration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Set for deliveries that wait for an explicit `ack`/`reject`
    pub delivery_tag: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Fanout,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker forgets a message once it is delivered.
    Auto,
    /// Each delivery stays unacknowledged until `ack` or `reject`; the
    /// prefetch limit applies.
    Manual,
}

/// Broker operations the AMQP transport needs.
#[async_trait]
pub trait AmqpLink: Send + Sync {
    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Exclusive, auto-deleted queue owned by this session.
    async fn declare_reply_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Queue whose messages expire after `delay` and are then dead-lettered
    /// to `dead_letter_exchange` under their original routing key.
    async fn declare_wait_queue(
        &self,
        queue: &str,
        delay: Duration,
        dead_letter_exchange: &str,
    ) -> Result<(), TransportError>;

    async fn declare_exchange(&self, exchange: &str, kind: ExchangeType)
    -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        mode: AckMode,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Negative acknowledgement without requeueing.
    async fn reject(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Binds a private queue to the fanout `exchange` and streams its payloads.
    async fn consume_exchange(
        &self,
        exchange: &str,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    async fn close(&self);
}

pub struct AmqpSession {
    pub link: Arc<dyn AmqpLink>,
    /// Fires with a reason once the broker connection is lost.
    pub closed: oneshot::Receiver<String>,
}

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self) -> Result<AmqpSession, TransportError>;
}
