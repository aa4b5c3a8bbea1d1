//! App - アプリケーション層
//!
//! ports を組み合わせてパイプラインを組み立てます。
//!
//! # 主要コンポーネント
//! - **Dispatcher**: claim → publish → revert
//! - **SchedulerLoop**: 期限が来た Task を探して Dispatcher に渡す
//! - **ExecutionConsumer**: 配送された Task を実行して結果を書き戻す
//! - **Supervisor**: 2 つのループの起動と停止
//! - **WorkerBuilder**: Supervisor の構築（Fail-fast）
//! - **TaskService**: HTTP 境界向けの CRUD と「今すぐ実行」

pub mod builder;
pub mod consumer_loop;
pub mod dispatcher;
pub mod scheduler_loop;
pub mod service;
pub mod settings;
pub mod shutdown;
pub mod status;
pub mod supervisor;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, WorkerBuilder};
pub use self::consumer_loop::{ConsumerError, ExecutionConsumer, HandleOutcome};
pub use self::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
pub use self::scheduler_loop::{CycleReport, SchedulerLoop};
pub use self::service::{NewTask, ServiceError, TaskService, TaskUpdate};
pub use self::settings::{SchedulerSettings, Topology, WorkerSettings};
pub use self::shutdown::{Shutdown, ShutdownListener};
pub use self::status::TaskCounts;
pub use self::supervisor::{Supervisor, SupervisorError};
