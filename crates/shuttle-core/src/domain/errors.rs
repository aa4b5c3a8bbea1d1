//! Errors - ドメインエラーと分類
//!
//! # 分類
//! - Validation: 入力が不正（リトライ無意味、呼び出し側に返す）
//! - Transient: 一時的なインフラ障害（配送は requeue、scheduler は次の周期で拾い直す）
//! - Permanent: 何度やっても成功しない（配送メッセージの破損など）

use thiserror::Error;

use super::state::TaskStatus;

/// ErrorKind は運用上の分類
///
/// ExecutionConsumer は保存失敗の `kind()` を見て、Transient なら requeue、
/// それ以外なら ack して捨てる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Permanent,
}

/// Task の入力検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid task ID")]
    InvalidTaskId,

    #[error("invalid task name")]
    InvalidTaskName,

    #[error("invalid command")]
    InvalidCommand,

    #[error("invalid task status: {0:?}")]
    InvalidStatus(String),

    #[error("invalid scheduled time")]
    InvalidScheduledAt,
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// 状態遷移の拒否
///
/// 呼び出し側は現在の状態を読み直してから判断すること。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// 配送メッセージのデコード失敗（壊れたメッセージは再送しても直らない）
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed dispatch payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}
