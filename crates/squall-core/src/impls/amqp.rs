//! AMQP (RabbitMQ) adapter - Publisher と DeliverySource の本番実装
//!
//! - exchange（direct, durable）と queue（durable）を宣言して bind する
//! - channel は publisher confirm モードにする。broker の Nack は publish 失敗として返す
//! - publish は persistent（delivery_mode = 2）で、transport の message_id に重複排除キーを載せる
//! - consume は prefetch 付きの basic_consume。ack / nack(requeue) は Delivery から返す

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;

use crate::domain::{DeliveryRequest, MessageId};
use crate::error::PortError;
use crate::ports::{Delivery, DeliverySource, Publisher};

const PERSISTENT: u8 = 2;

fn broker_error(context: &str, err: lapin::Error) -> PortError {
    PortError::Failed(format!("{context}: {err}"))
}

/// Only a broker Ack counts as published.
fn check_confirmation(confirmation: &Confirmation) -> Result<(), PortError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(PortError::Failed(
            "publish confirm: broker refused the message".to_string(),
        )),
        Confirmation::NotRequested => Err(PortError::Failed(
            "publish confirm: channel is not in confirm mode".to_string(),
        )),
    }
}

/// Exchange/queue topology for the delivery queue.
#[derive(Debug, Clone)]
pub struct AmqpTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

pub struct AmqpBroker {
    _connection: Arc<Connection>,
    channel: Channel,
    topology: AmqpTopology,
}

impl AmqpBroker {
    pub async fn connect(url: &str, topology: AmqpTopology) -> Result<Self, PortError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| broker_error("connect to broker", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| broker_error("create channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_error("enable publisher confirms", e))?;

        channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("declare exchange", e))?;
        channel
            .queue_declare(
                &topology.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("declare queue", e))?;
        channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                &topology.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("bind queue", e))?;

        tracing::info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            routing_key = %topology.routing_key,
            "connected to broker"
        );

        Ok(Self {
            _connection: Arc::new(connection),
            channel,
            topology,
        })
    }

    pub fn topology(&self) -> &AmqpTopology {
        &self.topology
    }

    /// Start consuming the delivery queue with at most `prefetch` unacked messages.
    pub async fn consume(
        &self,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<AmqpDeliverySource, PortError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| broker_error("set prefetch", e))?;
        let consumer = self
            .channel
            .basic_consume(
                &self.topology.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| broker_error("start consumer", e))?;

        Ok(AmqpDeliverySource {
            consumer: Mutex::new(consumer),
        })
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn publish(&self, routing_key: &str, request: &DeliveryRequest) -> Result<(), PortError> {
        let payload = request
            .to_bytes()
            .map_err(|e| PortError::Failed(format!("encode delivery request: {e}")))?;
        let properties = BasicProperties::default()
            .with_message_id(request.message_id.as_str().into())
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                &self.topology.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| broker_error("publish", e))?
            .await
            .map_err(|e| broker_error("publish confirm", e))?;
        check_confirmation(&confirmation)?;

        tracing::debug!(message_id = %request.message_id, routing_key, "published delivery request");
        Ok(())
    }
}

pub struct AmqpDeliverySource {
    consumer: Mutex<Consumer>,
}

#[async_trait]
impl DeliverySource for AmqpDeliverySource {
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>> {
        let mut consumer = self.consumer.lock().await;
        loop {
            match consumer.next().await? {
                Ok(delivery) => return Some(Box::new(AmqpDelivery::new(delivery))),
                Err(e) => {
                    // channel が閉じた後はストリームが終わる
                    tracing::warn!(error = %e, "broker consumer error");
                }
            }
        }
    }
}

struct AmqpDelivery {
    message_id: Option<MessageId>,
    inner: lapin::message::Delivery,
}

impl AmqpDelivery {
    fn new(inner: lapin::message::Delivery) -> Self {
        let message_id = inner
            .properties
            .message_id()
            .as_ref()
            .map(|id| MessageId::new(id.as_str()));
        Self { message_id, inner }
    }
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    fn payload(&self) -> &[u8] {
        &self.inner.data
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), PortError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| broker_error("ack", e))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), PortError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|e| broker_error("nack", e))
    }
}
