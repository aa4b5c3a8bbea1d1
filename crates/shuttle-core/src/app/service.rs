//! TaskService - HTTP 境界から呼ばれる Task の CRUD
//!
//! - ID 未指定なら IdGenerator で採番、status 未指定なら pending
//! - 入力検証は `Task::validate`、重複は `AlreadyExists`
//! - 「今すぐ実行」は Scheduler と同じ Dispatcher を通す（claim が直列化点）

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::app::dispatcher::{DispatchError, DispatchOutcome, Dispatcher, bounded};
use crate::app::status::TaskCounts;
use crate::domain::{ErrorKind, Task, TaskId, TaskStatus, TransitionError, ValidationError};
use crate::ports::{BrokerError, Clock, IdGenerator, StoreError, TaskStore};

/// Body of a create request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Body of an update request. Replaces every editable field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    /// 省略時は現在の status のまま
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("task {id} is {status}, only pending tasks can be executed")]
    NotPending { id: TaskId, status: TaskStatus },

    #[error("task {0} changed concurrently, re-read and retry")]
    Conflict(TaskId),

    #[error("invalid time range: {from} is after {to}")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error("dispatch failed: {0}")]
    Publish(#[source] BrokerError),

    #[error(transparent)]
    Dispatch(DispatchError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::AlreadyExists(id) => ServiceError::AlreadyExists(id),
            other => ServiceError::Store(other),
        }
    }
}

impl From<DispatchError> for ServiceError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Transition(e) => ServiceError::Transition(e),
            DispatchError::Claim(e) => e.into(),
            other => ServiceError::Dispatch(other),
        }
    }
}

impl ServiceError {
    /// 呼び出し側の入力が原因か（HTTP なら 4xx）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_)
                | ServiceError::Transition(_)
                | ServiceError::NotFound(_)
                | ServiceError::AlreadyExists(_)
                | ServiceError::NotPending { .. }
                | ServiceError::Conflict(_)
                | ServiceError::InvalidRange { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Store(e) => e.kind(),
            ServiceError::Publish(e) => e.kind(),
            ServiceError::Dispatch(_) => ErrorKind::Transient,
            ServiceError::NotFound(_) | ServiceError::AlreadyExists(_) => ErrorKind::Permanent,
            _ => ErrorKind::Validation,
        }
    }
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    store_timeout: Duration,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            ids,
            store_timeout,
        }
    }

    pub async fn create(&self, new: NewTask) -> Result<Task, ServiceError> {
        let id = match new.id.filter(|raw| !raw.is_empty()) {
            Some(raw) => TaskId::parse(raw)?,
            None => self.ids.generate_task_id(),
        };
        let status = parse_status(new.status.as_deref())?.unwrap_or_default();

        let mut task = Task::new(id, new.name, new.command)
            .with_description(new.description)
            .with_status(status);
        task.scheduled_at = new.scheduled_at;
        task.validate(self.clock.now())?;

        let created = bounded(self.store_timeout, self.store.create(&task)).await?;
        info!(task_id = %created.id, "task created");
        Ok(created)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task, ServiceError> {
        bounded(self.store_timeout, self.store.get(id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ServiceError> {
        Ok(bounded(self.store_timeout, self.store.list_by_status(status)).await?)
    }

    /// Tasks whose scheduled time falls in `[from, to)`.
    pub async fn scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Task>, ServiceError> {
        if to < from {
            return Err(ServiceError::InvalidRange { from, to });
        }
        Ok(bounded(self.store_timeout, self.store.find_scheduled_between(from, to)).await?)
    }

    pub async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, ServiceError> {
        let existing = self.get(id).await?;

        let status = parse_status(update.status.as_deref())?.unwrap_or(existing.status);
        // 実行が始まったら scheduled_at は動かさない
        if existing.status != TaskStatus::Pending && update.scheduled_at != existing.scheduled_at {
            return Err(ValidationError::InvalidScheduledAt.into());
        }

        let mut task = Task::new(existing.id.clone(), update.name, update.command)
            .with_description(update.description)
            .with_status(status);
        task.scheduled_at = update.scheduled_at;
        task.output = existing.output;
        task.validate(self.clock.now())?;

        // 読んでから status が動いていたら（実行が終わった等）書かない
        let updated = bounded(
            self.store_timeout,
            self.store.compare_and_update(&task, existing.status),
        )
        .await?
        .ok_or_else(|| ServiceError::Conflict(id.clone()))?;
        info!(task_id = %updated.id, "task updated");
        Ok(updated)
    }

    pub async fn delete(&self, id: &TaskId) -> Result<(), ServiceError> {
        self.get(id).await?;
        bounded(self.store_timeout, self.store.delete(id)).await?;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Dispatch a pending task now, ignoring its scheduled time.
    pub async fn execute_now(&self, id: &TaskId) -> Result<Task, ServiceError> {
        let task = self.get(id).await?;
        if task.status != TaskStatus::Pending {
            return Err(ServiceError::NotPending {
                id: task.id,
                status: task.status,
            });
        }

        match self.dispatcher.dispatch(&task).await? {
            DispatchOutcome::Published(task) => {
                info!(task_id = %task.id, "task dispatched on demand");
                Ok(task)
            }
            DispatchOutcome::LostClaim => Err(ServiceError::Conflict(id.clone())),
            DispatchOutcome::Reverted(e) => Err(ServiceError::Publish(e)),
        }
    }

    pub async fn counts(&self) -> Result<TaskCounts, ServiceError> {
        let tasks = self.list(None).await?;
        Ok(tasks.into_iter().map(|task| task.status).collect())
    }
}

fn parse_status(raw: Option<&str>) -> Result<Option<TaskStatus>, ValidationError> {
    raw.filter(|s| !s.is_empty()).map(str::parse).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::settings::Topology;
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::{Broker, ExchangeKind, FixedClock, UlidGenerator};
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        service: TaskService,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let broker = Arc::new(InMemoryBroker::new());
        let topology = Topology::default();
        broker
            .declare_exchange(&topology.exchange, ExchangeKind::Direct)
            .await
            .unwrap();
        broker.declare_queue(&topology.queue).await.unwrap();
        broker
            .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
            .await
            .unwrap();

        let timeout = Duration::from_secs(1);
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            broker.clone(),
            clock.clone(),
            topology,
            timeout,
        ));
        let service = TaskService::new(
            store,
            dispatcher,
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
            timeout,
        );
        Fixture { broker, service }
    }

    fn new_task(id: Option<&str>) -> NewTask {
        NewTask {
            id: id.map(str::to_string),
            name: "backup".to_string(),
            command: "echo hi".to_string(),
            ..NewTask::default()
        }
    }

    fn id(raw: &str) -> TaskId {
        TaskId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn create_fills_id_and_status() {
        let f = fixture().await;
        let created = f.service.create(new_task(None)).await.unwrap();
        assert!(created.id.as_str().starts_with("task-"));
        assert_eq!(created.status, TaskStatus::Pending);
        assert_eq!(created.created_at, t0());
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let f = fixture().await;
        f.service.create(new_task(Some("t1"))).await.unwrap();
        let err = f.service.create(new_task(Some("t1"))).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
        assert!(err.is_client_error());
    }

    #[rstest]
    #[case::bad_id(NewTask { id: Some("no spaces".into()), ..new_task(None) })]
    #[case::empty_name(NewTask { name: String::new(), ..new_task(None) })]
    #[case::blank_command(NewTask { command: "  ".into(), ..new_task(None) })]
    #[case::bogus_status(NewTask { status: Some("bogus".into()), ..new_task(None) })]
    #[case::past_schedule(NewTask { scheduled_at: Some(t0() - chrono::Duration::seconds(1)), ..new_task(None) })]
    #[tokio::test]
    async fn create_validates_input(#[case] input: NewTask) {
        let f = fixture().await;
        let err = f.service.create(input).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)), "{err:?}");
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn update_keeps_identity_and_created_at() {
        let f = fixture().await;
        let created = f.service.create(new_task(Some("t1"))).await.unwrap();

        let updated = f
            .service
            .update(
                &created.id,
                TaskUpdate {
                    name: "renamed".to_string(),
                    command: "true".to_string(),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.status, TaskStatus::Pending);
        assert_eq!(updated.created_at, created.created_at);
    }

    #[tokio::test]
    async fn update_and_delete_of_missing_task_are_not_found() {
        let f = fixture().await;
        let update = TaskUpdate {
            name: "x".to_string(),
            command: "true".to_string(),
            ..TaskUpdate::default()
        };
        assert!(matches!(
            f.service.update(&id("ghost"), update).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            f.service.delete(&id("ghost")).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn execute_now_dispatches_pending_task() {
        let f = fixture().await;
        let created = f
            .service
            .create(NewTask {
                scheduled_at: Some(t0() + chrono::Duration::hours(6)),
                ..new_task(Some("t1"))
            })
            .await
            .unwrap();

        let dispatched = f.service.execute_now(&created.id).await.unwrap();
        assert_eq!(dispatched.status, TaskStatus::Running);
        assert_eq!(f.broker.queue_len("tasks_queue").await, 1);

        let again = f.service.execute_now(&created.id).await.unwrap_err();
        assert!(matches!(again, ServiceError::NotPending { status: TaskStatus::Running, .. }));
    }

    #[tokio::test]
    async fn execute_now_reports_publish_failure() {
        let f = fixture().await;
        let created = f.service.create(new_task(Some("t1"))).await.unwrap();
        f.broker.fail_next_publishes(1);

        let err = f.service.execute_now(&created.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Publish(_)));
        assert!(!err.is_client_error());
        assert_eq!(
            f.service.get(&created.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn scheduled_between_rejects_inverted_range() {
        let f = fixture().await;
        let err = f
            .service
            .scheduled_between(t0(), t0() - chrono::Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn counts_by_status() {
        let f = fixture().await;
        f.service.create(new_task(Some("a"))).await.unwrap();
        f.service
            .create(NewTask {
                status: Some("failed".to_string()),
                ..new_task(Some("b"))
            })
            .await
            .unwrap();

        let counts = f.service.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);
    }
}
