//! Domain identifiers.
//!
//! # TaskId
//! TaskId は外部（HTTP / CLI）から渡される不透明な文字列 ID です。
//! `[A-Za-z0-9-]+` に制限し、生成時とデシリアライズ時の両方で検証します。
//! 一度作られた TaskId は不変です。
//!
//! 呼び出し側が ID を指定しない場合は `IdGenerator` が ULID ベースの ID
//! （`task-01H...`）を払い出します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ValidationError;

/// Identifier of a Task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// 文字列を検証して TaskId を作る
    pub fn parse(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if is_valid_task_id(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidTaskId)
        }
    }

    /// Generator-produced IDs are alphanumeric by construction.
    pub(crate) fn from_generated(value: String) -> Self {
        debug_assert!(is_valid_task_id(&value));
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_task_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl TryFrom<String> for TaskId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl FromStr for TaskId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
