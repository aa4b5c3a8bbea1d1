//! Domain model (IDs, task, status state machine, dispatch message, errors).
//!
//! - ids: TaskId（検証済みの文字列 ID）
//! - task: Task 本体と入力検証
//! - state: TaskStatus と状態遷移
//! - envelope: DispatchMessage（broker に流すスナップショット）
//! - errors: ErrorKind と各種ドメインエラー

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod state;
pub mod task;

pub use self::envelope::{CONTENT_TYPE_JSON, DispatchMessage};
pub use self::errors::{DecodeError, ErrorKind, TransitionError, ValidationError};
pub use self::ids::TaskId;
pub use self::state::{TaskStatus, transition};
pub use self::task::{MAX_NAME_LEN, Task};
