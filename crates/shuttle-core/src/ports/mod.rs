//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（Redis, RabbitMQ, OS プロセス）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - Redis が source of truth（正本）
//! - RabbitMQ は配送キュー（Task のスナップショットを運ぶ）
//! - 時刻と ID 生成もテストのために差し替え可能にする

pub mod broker;
pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod task_store;

pub use self::broker::{Broker, BrokerError, Delivery, DeliveryStream, ExchangeKind};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{CommandExecutor, ExecutionFailed, FailureCause};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{StatusChange, StoreError, TaskStore};
