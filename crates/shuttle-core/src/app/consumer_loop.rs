//! ExecutionConsumer - 配送された Task を実行して結果を書き戻す
//!
//! # フロー（1 メッセージ）
//! 1. decode。壊れていれば `nack(requeue = false)`（データ損失として error ログ）
//! 2. スナップショットが running なら保存中のレコードを読み直す。pending なら
//!    `change_status` で running にする。終端状態なら reject
//! 3. 保存中のレコードのコマンドを実行（タイムアウト付き）
//! 4. `running → completed | failed` と output だけを `change_status` で書く。
//!    実行中に入った編集は残る
//! 5. 保存できたら ack。一時的な保存失敗は `nack(requeue = true)`、
//!    恒久的なもの（削除済みなど）は ack して捨てる
//!
//! # 再配送
//! 保存中のレコードがもう終端状態なら実行せずに ack する。最初に書かれた結果が残る。
//! 保存に失敗した後の再配送ではコマンドが再実行されうる（at-least-once）。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::app::dispatcher::bounded;
use crate::app::shutdown::ShutdownListener;
use crate::domain::{DispatchMessage, ErrorKind, Task, TaskId, TaskStatus};
use crate::ports::{
    Broker, BrokerError, CommandExecutor, Delivery, StatusChange, StoreError, TaskStore,
};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("delivery stream for queue {0} closed")]
    StreamClosed(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Acked,
    Requeued,
    Rejected,
}

pub struct ExecutionConsumer {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn CommandExecutor>,
    queue: String,
    execution_timeout: Duration,
    store_timeout: Duration,
}

impl ExecutionConsumer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn CommandExecutor>,
        queue: impl Into<String>,
        execution_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            executor,
            queue: queue.into(),
            execution_timeout,
            store_timeout,
        }
    }

    /// Consume until `shutdown` fires.
    ///
    /// Shutdown is only observed between messages. A stream that ends or
    /// fails for any other reason is an error.
    pub async fn run(&self, mut shutdown: ShutdownListener) -> Result<(), ConsumerError> {
        let mut deliveries = self.broker.consume(&self.queue).await?;
        info!(queue = %self.queue, "execution consumer started");

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let next = tokio::select! {
                next = deliveries.next() => next,
                _ = shutdown.wait() => break,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(delivery).await;
                }
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "delivery stream failed");
                    return Err(e.into());
                }
                None if shutdown.is_shutdown() => break,
                None => {
                    error!(queue = %self.queue, "delivery stream closed by broker");
                    return Err(ConsumerError::StreamClosed(self.queue.clone()));
                }
            }
        }

        info!(queue = %self.queue, "execution consumer stopped");
        Ok(())
    }

    /// Process one delivery and settle it.
    pub async fn handle(&self, delivery: Box<dyn Delivery>) -> HandleOutcome {
        let snapshot = match DispatchMessage::decode(delivery.payload()) {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "dropping malformed dispatch message");
                settle(delivery.nack(false).await);
                return HandleOutcome::Rejected;
            }
        };
        debug!(task_id = %snapshot.id, redelivered = delivery.redelivered(), "task received");

        let current = match snapshot.status {
            TaskStatus::Running => match self.load_running(&snapshot.id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    settle(delivery.ack().await);
                    return HandleOutcome::Acked;
                }
                Err(e) => return self.store_failed(&snapshot.id, e, delivery).await,
            },
            TaskStatus::Pending => {
                // scheduler を経由しない producer 向け
                let start = StatusChange::new(TaskStatus::Pending, TaskStatus::Running);
                let started = match start {
                    Ok(change) => {
                        bounded(self.store_timeout, self.store.change_status(&snapshot.id, &change))
                            .await
                    }
                    Err(e) => {
                        warn!(task_id = %snapshot.id, error = %e, "cannot start task");
                        settle(delivery.nack(false).await);
                        return HandleOutcome::Rejected;
                    }
                };
                match started {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        debug!(task_id = %snapshot.id, "task already started elsewhere");
                        settle(delivery.ack().await);
                        return HandleOutcome::Acked;
                    }
                    Err(e) => return self.store_failed(&snapshot.id, e, delivery).await,
                }
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                warn!(task_id = %snapshot.id, status = %snapshot.status, "refusing to execute finished task");
                settle(delivery.nack(false).await);
                return HandleOutcome::Rejected;
            }
        };

        let (status, output) = match self
            .executor
            .execute(&current.command, self.execution_timeout)
            .await
        {
            Ok(output) => (TaskStatus::Completed, output),
            Err(failed) => {
                info!(task_id = %current.id, cause = %failed.cause, "command failed");
                (TaskStatus::Failed, failed.output)
            }
        };

        let finish = match StatusChange::new(TaskStatus::Running, status) {
            Ok(change) => change.with_output(output),
            Err(e) => {
                warn!(task_id = %current.id, error = %e, "cannot record outcome");
                settle(delivery.nack(false).await);
                return HandleOutcome::Rejected;
            }
        };

        match bounded(self.store_timeout, self.store.change_status(&current.id, &finish)).await {
            Ok(Some(saved)) => {
                info!(task_id = %saved.id, status = %saved.status, "task finished");
                settle(delivery.ack().await);
                HandleOutcome::Acked
            }
            Ok(None) => {
                warn!(task_id = %current.id, outcome = %status, "task left running meanwhile, outcome dropped");
                settle(delivery.ack().await);
                HandleOutcome::Acked
            }
            Err(e) => self.store_failed(&current.id, e, delivery).await,
        }
    }

    /// 保存中のレコードを読み、まだ running ならそれを返す
    ///
    /// `Ok(None)` は削除済みか、別の配送がもう結果を書いた場合。
    async fn load_running(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        match bounded(self.store_timeout, self.store.get(id)).await? {
            Some(task) if task.status == TaskStatus::Running => Ok(Some(task)),
            Some(task) => {
                debug!(task_id = %id, status = %task.status, "task already settled, skipping");
                Ok(None)
            }
            None => {
                warn!(task_id = %id, "task deleted while in flight, dropping delivery");
                Ok(None)
            }
        }
    }

    async fn store_failed(
        &self,
        id: &TaskId,
        err: StoreError,
        delivery: Box<dyn Delivery>,
    ) -> HandleOutcome {
        match err.kind() {
            ErrorKind::Transient => {
                warn!(task_id = %id, error = %err, "failed to persist task, requeueing");
                settle(delivery.nack(true).await);
                HandleOutcome::Requeued
            }
            // 削除済みなど。再送しても成功しない
            ErrorKind::Permanent | ErrorKind::Validation => {
                warn!(task_id = %id, error = %err, "task cannot be persisted, dropping delivery");
                settle(delivery.ack().await);
                HandleOutcome::Acked
            }
        }
    }
}

fn settle(result: Result<(), BrokerError>) {
    if let Err(e) = result {
        warn!(error = %e, "failed to settle delivery");
    }
}
