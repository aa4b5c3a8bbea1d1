//! CommandExecutor port - Task のコマンドを実行する
//!
//! 1 回実行して結果を返すだけ。リトライはしない。
//! 失敗の種類（非ゼロ終了・シグナル・起動失敗・タイムアウト）は
//! すべて `ExecutionFailed` にまとめ、Task の状態は呼び出し側が決める。

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    ExitCode(i32),
    Signal(i32),
    Spawn(String),
    TimedOut(Duration),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::ExitCode(code) => write!(f, "exit status {code}"),
            FailureCause::Signal(signal) => write!(f, "terminated by signal {signal}"),
            FailureCause::Spawn(reason) => write!(f, "could not start: {reason}"),
            FailureCause::TimedOut(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command failed ({cause})")]
pub struct ExecutionFailed {
    pub output: String,
    pub cause: FailureCause,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` and return its combined output.
    ///
    /// Must return within roughly `timeout`.
    async fn execute(&self, command: &str, timeout: Duration) -> Result<String, ExecutionFailed>;
}
