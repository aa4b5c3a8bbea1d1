//! TaskStore port - Task の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - Task 本体（id -> task）
//! - 全 ID の索引（list 用）
//! - scheduled_at の順序付き索引（時刻範囲クエリ用）
//!
//! # 実装
//! - **InMemoryTaskStore**: テスト・開発用
//! - **RedisTaskStore**: 本番用

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ErrorKind, Task, TaskId, TaskStatus, TransitionError, transition};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("failed to encode/decode task: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store operation timed out")]
    Timeout,

    #[error("task {0} kept changing, giving up")]
    Contended(TaskId),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// NotFound / AlreadyExists はリトライしても変わらない
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::AlreadyExists(_) => ErrorKind::Permanent,
            StoreError::Serialization(_) => ErrorKind::Permanent,
            StoreError::Timeout | StoreError::Contended(_) | StoreError::Backend(_) => {
                ErrorKind::Transient
            }
        }
    }
}

/// A status change applied to whatever record is stored at write time.
///
/// Only `status`, `output` (when given) and `updated_at` are written; any
/// other field edited since the caller's read is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    from: TaskStatus,
    to: TaskStatus,
    output: Option<String>,
    due_by: Option<DateTime<Utc>>,
}

impl StatusChange {
    /// 状態機械が許す遷移だけ作れる
    pub fn new(from: TaskStatus, to: TaskStatus) -> Result<Self, TransitionError> {
        transition(from, to)?;
        Ok(Self {
            from,
            to,
            output: None,
            due_by: None,
        })
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// 保存済みの scheduled_at が `at` 以前のときだけ適用する
    pub fn due_by(mut self, at: DateTime<Utc>) -> Self {
        self.due_by = Some(at);
        self
    }

    pub fn from(&self) -> TaskStatus {
        self.from
    }

    pub fn to(&self) -> TaskStatus {
        self.to
    }

    /// Apply to the stored `current`, or `None` if a precondition fails.
    pub fn apply(&self, current: &Task) -> Option<Task> {
        if current.status != self.from {
            return None;
        }
        if let Some(at) = self.due_by
            && !current.is_due(at)
        {
            return None;
        }

        let mut next = current.clone();
        next.status = self.to;
        if let Some(output) = &self.output {
            next.output = Some(output.clone());
        }
        Some(next)
    }
}

/// TaskStore は Task の CRUD と時刻範囲クエリを提供
///
/// # 設計原則
/// - `create` / `update` が created_at / updated_at を設定する（呼び出し側の値は無視）
/// - `update` は created_at を保持し、updated_at を単調非減少に保つ
/// - 単一キーの書き込みはアトミック、索引を伴う書き込みはトランザクションで行う
/// - 状態遷移（claim / revert / 実行結果）は `change_status` で、保存中のレコードに当てる
/// - `compare_and_update` は編集の書き込み用（status が読んだときのままなら全体を置き換える）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. `AlreadyExists` if the ID is taken.
    async fn create(&self, task: &Task) -> Result<Task, StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Overwrite an existing task. `NotFound` if it does not exist.
    async fn update(&self, task: &Task) -> Result<Task, StoreError>;

    /// Overwrite only if the stored status is still `expected`.
    ///
    /// Returns `Ok(None)` when the precondition fails (someone else moved
    /// the task first) and the stored record otherwise. Meant for edits;
    /// status transitions go through `change_status`.
    async fn compare_and_update(
        &self,
        task: &Task,
        expected: TaskStatus,
    ) -> Result<Option<Task>, StoreError>;

    /// Apply `change` to the stored record atomically.
    ///
    /// `NotFound` if the task does not exist, `Ok(None)` if the stored status
    /// (or schedule) does not satisfy `change`.
    async fn change_status(
        &self,
        id: &TaskId,
        change: &StatusChange,
    ) -> Result<Option<Task>, StoreError>;

    /// Remove the task and its index entries. Deleting a missing task is a no-op.
    async fn delete(&self, id: &TaskId) -> Result<(), StoreError>;

    /// All tasks, or only those in `status`.
    async fn list_by_status(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError>;

    /// Tasks whose scheduled_at is in `[from, to)`, ordered by scheduled_at.
    async fn find_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn stored() -> Task {
        Task::new(TaskId::parse("t1").unwrap(), "edited", "echo new").with_scheduled_at(at())
    }

    #[test]
    fn only_valid_transitions_can_be_built() {
        assert!(StatusChange::new(TaskStatus::Pending, TaskStatus::Running).is_ok());
        assert!(StatusChange::new(TaskStatus::Completed, TaskStatus::Running).is_err());
        assert!(StatusChange::new(TaskStatus::Pending, TaskStatus::Completed).is_err());
    }

    #[test]
    fn apply_keeps_every_other_field() {
        let change = StatusChange::new(TaskStatus::Pending, TaskStatus::Running).unwrap();
        let next = change.apply(&stored()).unwrap();
        assert_eq!(next.status, TaskStatus::Running);
        assert_eq!(next.name, "edited");
        assert_eq!(next.command, "echo new");
        assert_eq!(next.scheduled_at, Some(at()));
        assert_eq!(next.output, None);
    }

    #[test]
    fn apply_checks_status_and_schedule() {
        let claim = StatusChange::new(TaskStatus::Pending, TaskStatus::Running).unwrap();
        let running = stored().with_status(TaskStatus::Running);
        assert_eq!(claim.apply(&running), None);

        let early = claim.clone().due_by(at() - Duration::seconds(1));
        assert_eq!(early.apply(&stored()), None);
        assert!(claim.due_by(at()).apply(&stored()).is_some());
    }

    #[test]
    fn output_is_replaced_only_when_given() {
        let mut current = stored().with_status(TaskStatus::Running);
        current.output = Some("previous".to_string());

        let keep = StatusChange::new(TaskStatus::Running, TaskStatus::Pending).unwrap();
        assert_eq!(keep.apply(&current).unwrap().output.as_deref(), Some("previous"));

        let record = StatusChange::new(TaskStatus::Running, TaskStatus::Failed)
            .unwrap()
            .with_output("boom");
        assert_eq!(record.apply(&current).unwrap().output.as_deref(), Some("boom"));
    }
}
