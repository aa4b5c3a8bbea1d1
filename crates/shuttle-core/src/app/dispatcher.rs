//! Dispatcher - claim → publish → (失敗時) revert
//!
//! Scheduler Loop と「今すぐ実行」の両方がここを通る。
//!
//! # フロー
//! 1. `pending → running` を `change_status` で claim（保存中のレコードに当てる）
//! 2. precondition 失敗 = 他の誰かが claim 済み、または期限が動いた → 何もしない
//! 3. claim 後のレコードを DispatchMessage にして publish
//! 4. publish 失敗 → `running → pending` を `change_status` で戻す
//!
//! 呼び出し側が読んだスナップショットは ID と status しか使わない。
//! 読んでから claim までの間の編集はそのまま残る。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::app::settings::Topology;
use crate::domain::{DispatchMessage, Task, TaskId, TaskStatus, TransitionError};
use crate::ports::{Broker, BrokerError, Clock, StatusChange, StoreError, TaskStore};

/// Bound a store call by `limit`.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// claim して publish まで済んだ（running の Task）
    Published(Task),
    /// 他の actor が先に claim した、または期限が先に延びた
    LostClaim,
    /// publish に失敗したので pending に戻した
    Reverted(BrokerError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("claim failed: {0}")]
    Claim(#[source] StoreError),

    /// publish も revert も失敗。Task は running のまま残る。
    #[error("publish failed ({publish}) and task {task_id} could not be reverted: {revert}")]
    RevertFailed {
        task_id: TaskId,
        publish: BrokerError,
        revert: StoreError,
    },
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    topology: Topology,
    store_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        topology: Topology,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            topology,
            store_timeout,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Claim `task` regardless of its schedule and hand it to the broker.
    ///
    /// `task` is the snapshot the caller read; its status must be `pending`.
    pub async fn dispatch(&self, task: &Task) -> Result<DispatchOutcome, DispatchError> {
        let claim = StatusChange::new(task.status, TaskStatus::Running)?;
        self.claim_and_publish(&task.id, claim).await
    }

    /// Like [`dispatch`](Self::dispatch), but only if the stored task is
    /// still due at `now`.
    pub async fn dispatch_due(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let claim = StatusChange::new(task.status, TaskStatus::Running)?.due_by(now);
        self.claim_and_publish(&task.id, claim).await
    }

    async fn claim_and_publish(
        &self,
        id: &TaskId,
        claim: StatusChange,
    ) -> Result<DispatchOutcome, DispatchError> {
        let claimed = bounded(self.store_timeout, self.store.change_status(id, &claim))
            .await
            .map_err(DispatchError::Claim)?;
        let Some(claimed) = claimed else {
            debug!(task_id = %id, "claim lost");
            return Ok(DispatchOutcome::LostClaim);
        };

        match self.publish(&claimed).await {
            Ok(()) => {
                debug!(task_id = %claimed.id, "task published");
                Ok(DispatchOutcome::Published(claimed))
            }
            Err(publish) => {
                warn!(task_id = %claimed.id, error = %publish, "publish failed, reverting claim");
                self.revert(claimed.id, publish).await
            }
        }
    }

    async fn publish(&self, task: &Task) -> Result<(), BrokerError> {
        let message = DispatchMessage::encode(task, self.clock.now())
            .map_err(|e| BrokerError::Publish(format!("encode: {e}")))?;
        self.broker
            .publish(&self.topology.exchange, &self.topology.routing_key, &message)
            .await
    }

    async fn revert(
        &self,
        task_id: TaskId,
        publish: BrokerError,
    ) -> Result<DispatchOutcome, DispatchError> {
        let back = StatusChange::new(TaskStatus::Running, TaskStatus::Pending)?;
        let reverted = bounded(self.store_timeout, self.store.change_status(&task_id, &back)).await;

        match reverted {
            // None = 誰かが先に状態を変えた。こちらで戻すものはない
            Ok(_) => Ok(DispatchOutcome::Reverted(publish)),
            Err(revert) => {
                error!(task_id = %task_id, error = %revert, "task left running after failed publish");
                Err(DispatchError::RevertFailed {
                    task_id,
                    publish,
                    revert,
                })
            }
        }
    }
}
