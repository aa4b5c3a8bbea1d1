//! AmqpBroker - RabbitMQ (lapin) 版の Broker
//!
//! # 実装詳細
//! - publish 用 channel は confirm モード、publish ごとに broker の確認を待つ
//! - consume 用 channel は prefetch = 1（1 件ずつ処理）
//! - exchange / queue は durable、メッセージは persistent（delivery_mode = 2）

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery as AmqpMessage;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info};

use crate::domain::DispatchMessage;
use crate::ports::{Broker, BrokerError, Delivery, DeliveryStream, ExchangeKind};

const PERSISTENT: u8 = 2;

fn other(context: &str) -> impl FnOnce(lapin::Error) -> BrokerError + '_ {
    move |e| BrokerError::Other(format!("{context}: {e}"))
}

pub struct AmqpBroker {
    connection: Connection,
    publisher: Channel,
    consumer: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let consumer = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        consumer
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!("connected to rabbitmq");
        Ok(Self {
            connection,
            publisher,
            consumer,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let amqp_kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.publisher
            .exchange_declare(
                name,
                amqp_kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(other("exchange declare"))?;

        debug!(exchange = name, %kind, "exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.publisher
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(other("queue declare"))?;

        debug!(queue = name, "queue declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.publisher
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(other("queue bind"))?;

        debug!(queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &DispatchMessage,
    ) -> Result<(), BrokerError> {
        let timestamp = u64::try_from(message.published_at().timestamp()).unwrap_or_default();
        let properties = BasicProperties::default()
            .with_content_type(message.content_type().into())
            .with_timestamp(timestamp)
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.body(),
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        // broker の確認を待つ
        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker refused message for {exchange}/{routing_key}"
            )));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let tag = format!("shuttle-{}", ulid::Ulid::new());
        let consumer = self
            .consumer
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(other("basic consume"))?;

        info!(queue, consumer_tag = %tag, "consumer registered");
        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(other("close"))?;
        info!("rabbitmq connection closed");
        Ok(())
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|message| Box::new(AmqpDelivery { message }) as Box<dyn Delivery>)
                .map_err(|e| BrokerError::Connection(e.to_string())),
        )
    }
}

struct AmqpDelivery {
    message: AmqpMessage,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.data
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.message
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.message
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
