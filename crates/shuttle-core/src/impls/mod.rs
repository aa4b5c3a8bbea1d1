//! Impls - ports の実装
//!
//! # 開発用・テスト用
//! - **InMemoryTaskStore**: HashMap + BTreeMap 索引
//! - **InMemoryBroker**: direct / fanout ルーティング、requeue、障害注入
//!
//! # 本番用
//! - **RedisTaskStore**: Redis（`task:{id}`, `tasks`, `scheduled_tasks`）
//! - **AmqpBroker**: RabbitMQ（lapin）
//! - **ShellExecutor**: `sh -c` で子プロセスを起動

pub mod amqp_broker;
pub mod inmem_broker;
pub mod inmem_store;
pub mod redis_store;
pub mod shell_executor;

// 主要な型を再エクスポート
pub use self::amqp_broker::AmqpBroker;
pub use self::inmem_broker::{BrokerStats, InMemoryBroker};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::redis_store::RedisTaskStore;
pub use self::shell_executor::{MAX_OUTPUT_SIZE, ShellExecutor};
