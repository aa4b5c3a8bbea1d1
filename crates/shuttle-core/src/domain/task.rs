//! Task - 実行単位
//!
//! Task はシェルコマンドと、それをいつ実行するか（scheduled_at）と、
//! いまどの状態にいるか（status）を持つ。
//!
//! # 不変条件
//! - id は作成後に変わらない
//! - created_at / updated_at は store 層が設定する（単調非減少）
//! - scheduled_at は実行開始後に変わらない

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::errors::{TransitionError, ValidationError};
use super::ids::TaskId;
use super::state::{TaskStatus, transition};

/// Maximum length of a task name, in characters.
pub const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_timestamp"
    )]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// 最後に実行したときの stdout/stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl Task {
    /// pending の Task を作る。タイムスタンプは store が埋める。
    pub fn new(id: TaskId, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            command: command.into(),
            status: TaskStatus::Pending,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            scheduled_at: None,
            output: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Validate user-supplied fields against `now`.
    ///
    /// The ID and status are already checked by their types; this covers the
    /// free-form fields and the schedule.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.id.as_str().is_empty() {
            return Err(ValidationError::InvalidTaskId);
        }

        let name_len = self.name.chars().count();
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(ValidationError::InvalidTaskName);
        }

        if self.command.trim().is_empty() {
            return Err(ValidationError::InvalidCommand);
        }

        if let Some(at) = self.scheduled_at
            && at < now
        {
            return Err(ValidationError::InvalidScheduledAt);
        }

        Ok(())
    }

    /// Is the task due at `now`? Unscheduled tasks are never due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_some_and(|at| at <= now)
    }

    /// 状態機械を通して status を書き換える
    pub fn transition_to(&mut self, requested: TaskStatus) -> Result<(), TransitionError> {
        self.status = transition(self.status, requested)?;
        Ok(())
    }
}

/// `scheduled_at` の読み込み
///
/// 古い producer は未設定の時刻を `0001-01-01T00:00:00Z` で送ってくるので、
/// epoch 以前の値は「未設定」とみなす。
fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|at| at.timestamp() > 0))
}
