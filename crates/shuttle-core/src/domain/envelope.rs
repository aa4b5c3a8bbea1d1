//! DispatchMessage - Scheduler から Consumer へ運ぶメッセージ
//!
//! 中身は dispatch 時点の Task のスナップショット（JSON）。
//!
//! # 互換性
//! - 未知のフィールドは無視する
//! - `scheduled_at` が無い、またはゼロ時刻なら未設定扱い
//! - status は 4 値以外を受け付けない（デコード失敗 = 恒久的に reject）

use chrono::{DateTime, Utc};

use super::errors::DecodeError;
use super::task::Task;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Wire payload handed to the broker.
///
/// Once published the broker owns it; the publisher keeps nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchMessage {
    body: Vec<u8>,
    content_type: &'static str,
    published_at: DateTime<Utc>,
}

impl DispatchMessage {
    /// Snapshot `task` into a JSON message stamped with `published_at`.
    pub fn encode(task: &Task, published_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: serde_json::to_vec(task)?,
            content_type: CONTENT_TYPE_JSON,
            published_at,
        })
    }

    /// Decode a delivered payload back into a Task.
    pub fn decode(payload: &[u8]) -> Result<Task, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskStatus};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn encode_writes_wire_field_names() {
        let task = Task::new(TaskId::parse("t1").unwrap(), "hello", "echo hi")
            .with_status(TaskStatus::Running)
            .with_scheduled_at(at());
        let message = DispatchMessage::encode(&task, at()).unwrap();

        assert_eq!(message.content_type(), "application/json");
        assert_eq!(message.published_at(), at());

        let value: serde_json::Value = serde_json::from_slice(message.body()).unwrap();
        for field in [
            "id",
            "name",
            "description",
            "command",
            "status",
            "created_at",
            "updated_at",
            "scheduled_at",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["status"], "running");
        assert!(value.get("output").is_none());

        assert_eq!(DispatchMessage::decode(message.body()).unwrap(), task);
    }

    #[test]
    fn decode_ignores_unknown_fields_and_missing_schedule() {
        let payload = br#"{"id":"t1","name":"n","description":"","command":"true",
            "status":"running","created_at":"2025-06-01T12:00:00Z",
            "updated_at":"2025-06-01T12:00:00Z","priority":7,"tags":["x"]}"#;
        let task = DispatchMessage::decode(payload).unwrap();
        assert_eq!(task.id.as_str(), "t1");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.scheduled_at, None);
    }

    #[test]
    fn decode_rejects_garbage_and_unknown_status() {
        assert!(DispatchMessage::decode(b"not json").is_err());
        assert!(DispatchMessage::decode(br#"{"id":"t1"}"#).is_err());

        let unknown_status = br#"{"id":"t1","name":"n","command":"c","status":"queued"}"#;
        let err = DispatchMessage::decode(unknown_status).unwrap_err();
        assert_eq!(err.kind(), crate::domain::ErrorKind::Permanent);
    }
}
