//! IdGenerator port - ID 生成の抽象化
//!
//! 呼び出し側が ID を指定せずに Task を作るときに使う。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（`task-<ULID>`）。ULID は英数字のみなので
//!   TaskId の文字種制限を常に満たす。

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散環境で衝突しない TaskId を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数タスクから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// FixedClock を渡せば timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        // ULID の文字列表現は Crockford base32 なので検証は不要
        TaskId::from_generated(format!("task-{}", self.next_ulid()))
    }
}
