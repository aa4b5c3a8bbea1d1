//! State - タスクの状態と状態遷移
//!
//! # 状態遷移
//! - pending -> running: dispatch 時（claim）
//! - running -> completed: コマンド成功
//! - running -> failed: コマンド失敗
//! - running -> pending: claim 後に publish が失敗したときの巻き戻し
//!
//! completed / failed は終端状態で、そこから先の遷移はない。
//! 状態機械は純粋関数で、状態そのものは保持しない。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{TransitionError, ValidationError};

/// Task status. Closed set, validated on every deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Can the state machine move from `self` to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Running, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidStatus(s.to_string()))
    }
}

/// 状態遷移の判定
///
/// `(current, requested)` から遷移後の状態を返す。許可されない組み合わせは
/// `TransitionError::InvalidTransition`。
pub fn transition(current: TaskStatus, requested: TaskStatus) -> Result<TaskStatus, TransitionError> {
    if current.can_transition_to(requested) {
        Ok(requested)
    } else {
        Err(TransitionError::InvalidTransition {
            from: current,
            to: requested,
        })
    }
}
