//! RedisTaskStore - 本番用の TaskStore
//!
//! # キー構成
//! - `task:{id}` → Task の JSON
//! - `tasks` (SET) → 全 Task ID
//! - `scheduled_tasks` (ZSET) → Task ID、score は scheduled_at の epoch ミリ秒
//!
//! # 一貫性
//! - create / compare_and_update / change_status は Lua script（キー単位でアトミック）
//! - change_status は読んだ JSON がそのまま残っているときだけ書く。
//!   途中で誰かが書いていたら読み直して当て直す
//! - update / delete は MULTI/EXEC pipeline で索引と一緒に書く
//! - ConnectionManager は clone して使い回す（内部で再接続する）

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use crate::domain::{Task, TaskId, TaskStatus};
use crate::ports::{Clock, StatusChange, StoreError, SystemClock, TaskStore};

const TASK_KEY_PREFIX: &str = "task:";
const TASKS_SET: &str = "tasks";
const SCHEDULED_ZSET: &str = "scheduled_tasks";

/// KEYS: task key, tasks set, scheduled zset
/// ARGV: json, id, score ('' = unscheduled)
const CREATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
if ARGV[3] ~= '' then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[2])
end
return 1
";

/// KEYS: task key, scheduled zset
/// ARGV: expected status, json, id, score ('' = unscheduled)
const COMPARE_AND_UPDATE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if cjson.decode(current)['status'] ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[4] == '' then
  redis.call('ZREM', KEYS[2], ARGV[3])
else
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[3])
end
return 1
";

/// KEYS: task key
/// ARGV: json as read, new json
const SWAP_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
";

/// change_status の読み直し回数
const MAX_SWAP_ATTEMPTS: usize = 5;

fn task_key(id: &TaskId) -> String {
    format!("{TASK_KEY_PREFIX}{id}")
}

fn score(task: &Task) -> String {
    task.scheduled_at
        .map(|at| at.timestamp_millis().to_string())
        .unwrap_or_default()
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

pub struct RedisTaskStore {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
    create_script: Script,
    cas_script: Script,
    swap_script: Script,
}

impl RedisTaskStore {
    /// 接続して PING で疎通確認する
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let mut conn = client.get_connection_manager().await.map_err(backend)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        info!("connected to redis");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            clock: Arc::new(SystemClock),
            create_script: Script::new(CREATE_SCRIPT),
            cas_script: Script::new(COMPARE_AND_UPDATE_SCRIPT),
            swap_script: Script::new(SWAP_SCRIPT),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn load_raw(&self, id: &TaskId) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(task_key(id))
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn load(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.load_raw(id)
            .await?
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<Task>, StoreError> {
        // MGET は引数 0 個だとエラーになる
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        for id in ids {
            cmd.arg(format!("{TASK_KEY_PREFIX}{id}"));
        }
        let raws: Vec<Option<String>> = cmd.query_async(&mut conn).await.map_err(backend)?;

        let mut tasks = Vec::with_capacity(raws.len());
        for (id, raw) in ids.iter().zip(raws) {
            match raw {
                Some(json) => tasks.push(serde_json::from_str(&json)?),
                None => warn!(task_id = %id, "index points at a missing task"),
            }
        }
        Ok(tasks)
    }

    /// created_at を引き継ぎ、updated_at を単調に進める
    fn stamp(&self, task: &Task, existing: &Task) -> Task {
        let mut task = task.clone();
        task.created_at = existing.created_at;
        task.updated_at = self.clock.now().max(existing.updated_at);
        task
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(&self, task: &Task) -> Result<Task, StoreError> {
        let now = self.clock.now();
        let mut task = task.clone();
        task.created_at = now;
        task.updated_at = now;
        let json = serde_json::to_string(&task)?;

        let mut conn = self.conn.clone();
        let created: i64 = self
            .create_script
            .key(task_key(&task.id))
            .key(TASKS_SET)
            .key(SCHEDULED_ZSET)
            .arg(json)
            .arg(task.id.as_str())
            .arg(score(&task))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if created == 0 {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }
        debug!(task_id = %task.id, "task created");
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.load(id).await
    }

    async fn update(&self, task: &Task) -> Result<Task, StoreError> {
        let existing = self
            .load(&task.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(task.id.clone()))?;
        let task = self.stamp(task, &existing);
        let json = serde_json::to_string(&task)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(task_key(&task.id))
            .arg(json)
            .ignore()
            .cmd("SADD")
            .arg(TASKS_SET)
            .arg(task.id.as_str())
            .ignore();
        match task.scheduled_at {
            Some(at) => pipe
                .cmd("ZADD")
                .arg(SCHEDULED_ZSET)
                .arg(at.timestamp_millis())
                .arg(task.id.as_str())
                .ignore(),
            None => pipe
                .cmd("ZREM")
                .arg(SCHEDULED_ZSET)
                .arg(task.id.as_str())
                .ignore(),
        };

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(task)
    }

    async fn compare_and_update(
        &self,
        task: &Task,
        expected: TaskStatus,
    ) -> Result<Option<Task>, StoreError> {
        let Some(existing) = self.load(&task.id).await? else {
            return Err(StoreError::NotFound(task.id.clone()));
        };
        if existing.status != expected {
            return Ok(None);
        }
        let task = self.stamp(task, &existing);
        let json = serde_json::to_string(&task)?;

        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas_script
            .key(task_key(&task.id))
            .key(SCHEDULED_ZSET)
            .arg(expected.as_str())
            .arg(json)
            .arg(task.id.as_str())
            .arg(score(&task))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        match swapped {
            1 => Ok(Some(task)),
            -1 => Err(StoreError::NotFound(task.id.clone())),
            _ => Ok(None),
        }
    }

    async fn change_status(
        &self,
        id: &TaskId,
        change: &StatusChange,
    ) -> Result<Option<Task>, StoreError> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let Some(raw) = self.load_raw(id).await? else {
                return Err(StoreError::NotFound(id.clone()));
            };
            let current: Task = serde_json::from_str(&raw)?;
            let Some(next) = change.apply(&current) else {
                return Ok(None);
            };
            let next = self.stamp(&next, &current);
            let json = serde_json::to_string(&next)?;

            let mut conn = self.conn.clone();
            let swapped: i64 = self
                .swap_script
                .key(task_key(id))
                .arg(raw)
                .arg(json)
                .invoke_async(&mut conn)
                .await
                .map_err(backend)?;

            match swapped {
                1 => return Ok(Some(next)),
                -1 => return Err(StoreError::NotFound(id.clone())),
                _ => debug!(task_id = %id, "task changed under us, re-reading"),
            }
        }
        Err(StoreError::Contended(id.clone()))
    }

    async fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(task_key(id))
            .ignore()
            .cmd("SREM")
            .arg(TASKS_SET)
            .arg(id.as_str())
            .ignore()
            .cmd("ZREM")
            .arg(SCHEDULED_ZSET)
            .arg(id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_by_status(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(TASKS_SET)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let mut tasks: Vec<Task> = self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn find_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        // [from, to) なので上限は排他的に指定する
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(SCHEDULED_ZSET)
            .arg(from.timestamp_millis())
            .arg(format!("({}", to.timestamp_millis()))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        self.load_many(&ids).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        info!("redis task store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn redis_url() -> String {
        std::env::var("SHUTTLE_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    fn unique_id(prefix: &str) -> TaskId {
        TaskId::parse(format!("{prefix}-{}", ulid::Ulid::new())).unwrap()
    }

    #[test]
    fn keys_and_scores() {
        let id = TaskId::parse("t1").unwrap();
        assert_eq!(task_key(&id), "task:t1");

        let at = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let task = Task::new(id, "n", "true").with_scheduled_at(at);
        assert_eq!(score(&task), "1735689600000");
        assert_eq!(score(&Task::new(TaskId::parse("t2").unwrap(), "n", "true")), "");
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn live_create_claim_and_query() {
        let store = RedisTaskStore::connect(&redis_url()).await.unwrap();
        let now = Utc::now();
        let id = unique_id("live");
        let task = Task::new(id.clone(), "live", "true").with_scheduled_at(now);

        store.create(&task).await.unwrap();
        assert!(matches!(
            store.create(&task).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let found = store
            .find_scheduled_between(now - Duration::seconds(1), now + Duration::seconds(1))
            .await
            .unwrap();
        assert!(found.iter().any(|t| t.id == id));

        let mut edited = task.clone();
        edited.command = "echo edited".to_string();
        store.update(&edited).await.unwrap();

        let claim = StatusChange::new(TaskStatus::Pending, TaskStatus::Running).unwrap();
        let claimed = store.change_status(&id, &claim).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.command, "echo edited");
        assert!(store.change_status(&id, &claim).await.unwrap().is_none());

        let finish = StatusChange::new(TaskStatus::Running, TaskStatus::Completed)
            .unwrap()
            .with_output("ok");
        let finished = store.change_status(&id, &finish).await.unwrap().unwrap();
        assert_eq!(finished.output.as_deref(), Some("ok"));
        assert_eq!(store.get(&id).await.unwrap().unwrap(), finished);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running redis"]
    async fn live_update_moves_the_index() {
        let store = RedisTaskStore::connect(&redis_url()).await.unwrap();
        let now = Utc::now();
        let id = unique_id("move");
        let created = store
            .create(&Task::new(id.clone(), "move", "true").with_scheduled_at(now))
            .await
            .unwrap();

        let mut unscheduled = created.clone();
        unscheduled.scheduled_at = None;
        let updated = store.update(&unscheduled).await.unwrap();
        assert_eq!(updated.created_at, created.created_at);

        let found = store
            .find_scheduled_between(now - Duration::seconds(1), now + Duration::seconds(1))
            .await
            .unwrap();
        assert!(found.iter().all(|t| t.id != id));

        store.delete(&id).await.unwrap();
    }
}
