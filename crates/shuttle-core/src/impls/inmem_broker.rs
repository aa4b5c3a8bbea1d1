//! InMemoryBroker - テスト用の Broker
//!
//! # 実装詳細
//! - exchange / binding / queue を 1 つの Mutex で管理
//! - Notify で「メッセージが来た」「close された」を待機中の consumer に通知
//! - direct（routing key 完全一致）と fanout をサポート
//! - `nack(requeue = true)` は queue の先頭に戻す（redelivered = true）
//! - `fail_next_publishes` で publish 失敗を注入できる
//!
//! # 使用例
//! ```ignore
//! let broker = InMemoryBroker::new();
//! broker.declare_exchange("tasks", ExchangeKind::Direct).await?;
//! broker.declare_queue("tasks_queue").await?;
//! broker.bind_queue("tasks_queue", "tasks", "tasks.routing.key").await?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::domain::DispatchMessage;
use crate::ports::{Broker, BrokerError, Delivery, DeliveryStream, ExchangeKind};

/// Counters for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: usize,
    pub acked: usize,
    pub requeued: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    stats: BrokerStats,
    closed: bool,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect())
    }
}

pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    failing_publishes: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            failing_publishes: AtomicUsize::new(0),
        }
    }

    /// 次の `n` 回の publish を失敗させる
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats
    }

    /// Number of messages waiting in `queue` (not counting in-flight deliveries).
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// queue に直接メッセージを積む（壊れたメッセージのテスト用）
    pub async fn inject(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let messages = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            messages.push_back(QueuedMessage {
                body,
                redelivered: false,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Other(format!(
                "exchange {name} already declared as {existing}"
            ))),
            _ => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let already_bound = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });
        if !already_bound {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &DispatchMessage,
    ) -> Result<(), BrokerError> {
        if self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            // binding が無ければ黙って捨てる（AMQP の mandatory = false と同じ）
            for queue in state.route(exchange, routing_key)? {
                if let Some(messages) = state.queues.get_mut(&queue) {
                    messages.push_back(QueuedMessage {
                        body: message.body().to_vec(),
                        redelivered: false,
                    });
                }
            }
            state.stats.published += 1;
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        Ok(Box::new(InMemoryDeliveryStream {
            queue: queue.to_string(),
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryDeliveryStream {
    queue: String,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl DeliveryStream for InMemoryDeliveryStream {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, BrokerError>> {
        loop {
            // ロックを離す前に waiter として登録しておく（通知の取りこぼし防止）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                let Some(messages) = state.queues.get_mut(&self.queue) else {
                    return Some(Err(BrokerError::QueueNotFound(self.queue.clone())));
                };
                if let Some(message) = messages.pop_front() {
                    return Some(Ok(Box::new(InMemoryDelivery {
                        queue: self.queue.clone(),
                        message,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    })));
                }
            }

            notified.await;
        }
    }
}

struct InMemoryDelivery {
    queue: String,
    message: QueuedMessage,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.body
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.state.lock().await.stats.acked += 1;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            if !requeue {
                state.stats.rejected += 1;
                return Ok(());
            }
            state.stats.requeued += 1;
            let Some(messages) = state.queues.get_mut(&self.queue) else {
                return Err(BrokerError::QueueNotFound(self.queue.clone()));
            };
            messages.push_front(QueuedMessage {
                body: self.message.body,
                redelivered: true,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
