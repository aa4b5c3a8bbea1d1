//! InMemoryTaskStore - 開発・テスト用の TaskStore
//!
//! # 実装詳細
//! - HashMap<TaskId, Task> が正本
//! - BTreeMap<scheduled_at, BTreeSet<TaskId>> が scheduled 索引（範囲クエリ用）
//! - 1 つの Mutex で両方を守るので、索引更新は常にアトミック
//! - 障害注入（`fail_next_writes` / `fail_next_queries`）でリトライ経路をテストできる

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Task, TaskId, TaskStatus};
use crate::ports::{Clock, StatusChange, StoreError, SystemClock, TaskStore};

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    scheduled: BTreeMap<DateTime<Utc>, BTreeSet<TaskId>>,
}

impl StoreState {
    fn index(&mut self, task: &Task) {
        if let Some(at) = task.scheduled_at {
            self.scheduled.entry(at).or_default().insert(task.id.clone());
        }
    }

    fn unindex(&mut self, task: &Task) {
        if let Some(at) = task.scheduled_at
            && let Some(ids) = self.scheduled.get_mut(&at)
        {
            ids.remove(&task.id);
            if ids.is_empty() {
                self.scheduled.remove(&at);
            }
        }
    }

    /// created_at を引き継ぎ、updated_at を単調に進めて置き換える
    fn replace(&mut self, mut task: Task, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let existing = self
            .tasks
            .get(&task.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;

        task.created_at = existing.created_at;
        task.updated_at = now.max(existing.updated_at);

        self.unindex(&existing);
        self.index(&task);
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    failing_writes: AtomicUsize,
    failing_queries: AtomicUsize,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            failing_writes: AtomicUsize::new(0),
            failing_queries: AtomicUsize::new(0),
        }
    }

    /// 次の `n` 回の update / compare_and_update / change_status を Backend エラーにする
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// 次の `n` 回の find_scheduled_between を Backend エラーにする
    pub fn fail_next_queries(&self, n: usize) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Backend(format!("injected {what} failure"))
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: &Task) -> Result<Task, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }

        let mut task = task.clone();
        task.created_at = now;
        task.updated_at = now;
        state.index(&task);
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<Task, StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(Self::injected("write"));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.replace(task.clone(), now)
    }

    async fn compare_and_update(
        &self,
        task: &Task,
        expected: TaskStatus,
    ) -> Result<Option<Task>, StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(Self::injected("write"));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let current = state.tasks.get(&task.id).map(|t| t.status);
        match current {
            None => Err(StoreError::NotFound(task.id.clone())),
            Some(status) if status != expected => Ok(None),
            Some(_) => state.replace(task.clone(), now).map(Some),
        }
    }

    async fn change_status(
        &self,
        id: &TaskId,
        change: &StatusChange,
    ) -> Result<Option<Task>, StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(Self::injected("write"));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let current = state
            .tasks
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        match change.apply(current) {
            Some(next) => state.replace(next, now).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.remove(id) {
            state.unindex(&task);
        }
        Ok(())
    }

    async fn list_by_status(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn find_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        if Self::take_failure(&self.failing_queries) {
            return Err(Self::injected("query"));
        }
        if from >= to {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .scheduled
            .range(from..to)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }
}
