//! Broker port - 配送キュー（RabbitMQ または InMemory）
//!
//! Scheduler が publish した DispatchMessage を Consumer が受け取る経路。
//!
//! # 実装
//! - **InMemoryBroker**: テスト用（publish 失敗の注入、close による切断）
//! - **AmqpBroker**: 本番用（lapin）
//!
//! # 設計原則
//! - 受け取った Delivery は必ず `ack` か `nack` する（受け取った側が所有する）
//! - `nack(requeue = true)` で再配送、`false` で破棄
//! - durable な exchange / queue の宣言は Supervisor が起動時に行う

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{DispatchMessage, ErrorKind};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("exchange {0} is not declared")]
    ExchangeNotFound(String),

    #[error("queue {0} is not declared")]
    QueueNotFound(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("acknowledgement failed: {0}")]
    Ack(String),

    #[error("broker is closed")]
    Closed,

    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ExchangeNotFound(_) | BrokerError::QueueNotFound(_) => {
                ErrorKind::Permanent
            }
            _ => ErrorKind::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// routing key の完全一致で配送
    Direct,
    /// bind されている全 queue に配送
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
        }
    }
}

/// A delivered message. The consumer owns it and must `ack` or `nack` it.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// Was this message delivered before and requeued?
    fn redelivered(&self) -> bool;

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// Sequence of deliveries from one queue.
///
/// `None` means the broker side closed the stream.
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Returns once the broker has accepted the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &DispatchMessage,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
