use super::link::{
    AckMode, AmqpConnector, AmqpLink, AmqpSession, ExchangeType, InboundMessage,
    OutboundMessage,
};
use async_trait::async_trait;
use courier_error::TransportError;
use courier_types::protocol::{CONTENT_ENCODING, CONTENT_TYPE};
use futures::{StreamExt, stream::BoxStream};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

fn link_error(err: lapin::Error) -> TransportError {
    TransportError::Connection(err.to_string())
}

fn publish_error(err: lapin::Error) -> TransportError {
    TransportError::Send(err.to_string())
}

/// Connects to RabbitMQ (or any AMQP 0.9.1 broker) through `lapin`.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    url: String,
    prefetch: u16,
}

impl LapinConnector {
    pub fn new(url: impl Into<String>, prefetch: u16) -> Self {
        Self {
            url: url.into(),
            prefetch,
        }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self) -> Result<AmqpSession, TransportError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(link_error)?;

        let (closed_tx, closed) = oneshot::channel();
        let closed_tx = Mutex::new(Some(closed_tx));
        connection.on_error(move |err| {
            if let Some(sender) = closed_tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = sender.send(err.to_string());
            }
        });

        let channel = connection.create_channel().await.map_err(link_error)?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(link_error)?;
        debug!(prefetch = self.prefetch, "AMQP channel opened");

        Ok(AmqpSession {
            link: Arc::new(LapinLink {
                connection,
                channel,
            }),
            closed,
        })
    }
}

struct LapinLink {
    connection: Connection,
    channel: Channel,
}

impl LapinLink {
    async fn consume_raw(
        &self,
        queue: &str,
        mode: AckMode,
    ) -> Result<lapin::Consumer, TransportError> {
        self.channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: mode == AckMode::Auto,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(link_error)
    }
}

#[async_trait]
impl AmqpLink for LapinLink {
    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(link_error)
    }

    async fn declare_reply_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(link_error)
    }

    async fn declare_wait_queue(
        &self,
        queue: &str,
        delay: Duration,
        dead_letter_exchange: &str,
    ) -> Result<(), TransportError> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)),
        );
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(dead_letter_exchange.into()),
        );

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(link_error)
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
    ) -> Result<(), TransportError> {
        let (kind, durable) = match kind {
            ExchangeType::Fanout => (ExchangeKind::Fanout, false),
            ExchangeType::Direct => (ExchangeKind::Direct, true),
        };
        self.channel
            .exchange_declare(
                exchange,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(link_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(link_error)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_content_encoding(CONTENT_ENCODING.into());
        if let Some(id) = message.correlation_id {
            properties = properties
                .with_correlation_id(id.clone().into())
                .with_message_id(id.into());
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if let Some(expiration) = message.expiration {
            properties = properties.with_expiration(expiration.as_millis().to_string().into());
        }

        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        mode: AckMode,
    ) -> Result<BoxStream<'static, InboundMessage>, TransportError> {
        let consumer = self.consume_raw(queue, mode).await?;
        let queue = queue.to_string();

        Ok(consumer
            .filter_map(move |delivery| {
                let queue = queue.clone();
                async move {
                    match delivery {
                        Ok(delivery) => Some(InboundMessage {
                            correlation_id: delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(|id| id.as_str().to_string()),
                            reply_to: delivery
                                .properties
                                .reply_to()
                                .as_ref()
                                .map(|queue| queue.as_str().to_string()),
                            delivery_tag: (mode == AckMode::Manual)
                                .then_some(delivery.delivery_tag),
                            payload: delivery.data,
                        }),
                        Err(err) => {
                            warn!(queue = %queue, error = %err, "AMQP delivery failed");
                            None
                        }
                    }
                }
            })
            .boxed())
    }

    async fn consume_exchange(
        &self,
        exchange: &str,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(link_error)?;
        self.channel
            .queue_bind(
                queue.name().as_str(),
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(link_error)?;

        let consumer = self.consume_raw(queue.name().as_str(), AckMode::Auto).await?;
        Ok(consumer
            .filter_map(|delivery| async move {
                match delivery {
                    Ok(delivery) => Some(delivery.data),
                    Err(err) => {
                        warn!(error = %err, "AMQP event delivery failed");
                        None
                    }
                }
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(link_error)
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                },
            )
            .await
            .map_err(link_error)
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "OK").await {
            debug!(error = %err, "AMQP channel close failed");
        }
        if let Err(err) = self.connection.close(200, "OK").await {
            debug!(error = %err, "AMQP connection close failed");
        }
    }
}
