//! Supervisor - SchedulerLoop と ExecutionConsumer のライフサイクル管理
//!
//! # 起動
//! - broker のトポロジ（durable な direct exchange / queue / binding）を宣言。失敗は致命的
//! - 2 つのループを別々の tokio タスクとして起動し、1 つの Shutdown を共有させる
//!
//! # 停止
//! - 外部からの停止要求、consumer のエラー終了、scheduler の panic のいずれかで停止
//! - shutdown_timeout まで両方の終了を待ち、残ったものは abort
//! - 最後に broker と store を閉じる

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::consumer_loop::{ConsumerError, ExecutionConsumer};
use crate::app::scheduler_loop::SchedulerLoop;
use crate::app::settings::Topology;
use crate::app::shutdown::Shutdown;
use crate::ports::{Broker, BrokerError, ExchangeKind, TaskStore};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to declare broker topology: {0}")]
    Topology(#[source] BrokerError),

    #[error("execution consumer failed: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("{0} task panicked")]
    Panicked(&'static str),
}

pub struct Supervisor {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    scheduler: Arc<SchedulerLoop>,
    consumer: Arc<ExecutionConsumer>,
    topology: Topology,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        scheduler: SchedulerLoop,
        consumer: ExecutionConsumer,
        topology: Topology,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            scheduler: Arc::new(scheduler),
            consumer: Arc::new(consumer),
            topology,
            shutdown_timeout,
        }
    }

    pub async fn declare_topology(&self) -> Result<(), SupervisorError> {
        let Topology {
            exchange,
            queue,
            routing_key,
        } = &self.topology;

        self.broker
            .declare_exchange(exchange, ExchangeKind::Direct)
            .await
            .map_err(SupervisorError::Topology)?;
        self.broker
            .declare_queue(queue)
            .await
            .map_err(SupervisorError::Topology)?;
        self.broker
            .bind_queue(queue, exchange, routing_key)
            .await
            .map_err(SupervisorError::Topology)?;

        info!(%exchange, %queue, %routing_key, "broker topology declared");
        Ok(())
    }

    /// Run both loops until `stop` resolves or a loop fails.
    pub async fn run<F>(self, stop: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()> + Send,
    {
        self.declare_topology().await?;

        let shutdown = Shutdown::new();

        let mut scheduler_task: JoinHandle<()> = {
            let scheduler = Arc::clone(&self.scheduler);
            let listener = shutdown.listener();
            tokio::spawn(async move { scheduler.run(listener).await })
        };
        let mut consumer_task: JoinHandle<Result<(), ConsumerError>> = {
            let consumer = Arc::clone(&self.consumer);
            let listener = shutdown.listener();
            tokio::spawn(async move { consumer.run(listener).await })
        };
        info!("worker started");

        let mut scheduler_done = false;
        let mut consumer_done = false;
        tokio::pin!(stop);

        let outcome = tokio::select! {
            _ = &mut stop => {
                info!("shutdown requested");
                Ok(())
            }
            joined = &mut consumer_task => {
                consumer_done = true;
                match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(error = %e, "execution consumer failed, shutting down");
                        Err(SupervisorError::Consumer(e))
                    }
                    Err(_) => {
                        error!("execution consumer panicked, shutting down");
                        Err(SupervisorError::Panicked("execution consumer"))
                    }
                }
            }
            joined = &mut scheduler_task => {
                scheduler_done = true;
                match joined {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        error!("scheduler loop panicked, shutting down");
                        Err(SupervisorError::Panicked("scheduler loop"))
                    }
                }
            }
        };

        shutdown.trigger();

        let drain = async {
            if !consumer_done {
                match (&mut consumer_task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "execution consumer failed while stopping"),
                    Err(e) => warn!(error = %e, "execution consumer panicked while stopping"),
                }
            }
            if !scheduler_done && let Err(e) = (&mut scheduler_task).await {
                warn!(error = %e, "scheduler loop panicked while stopping");
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(timeout = ?self.shutdown_timeout, "loops did not stop in time, aborting");
            consumer_task.abort();
            scheduler_task.abort();
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "failed to close broker");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "failed to close task store");
        }

        info!("worker stopped");
        outcome
    }
}
