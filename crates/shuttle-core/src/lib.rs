//! shuttle-core
//!
//! Scheduled shell-command dispatch: a scheduler hands due tasks to a broker,
//! a consumer executes them and records the outcome.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, state, envelope, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Broker, CommandExecutor, Clock, IdGenerator）
//! - **impls**: 実装（InMemory / Redis / AMQP / Shell）
//! - **app**: アプリケーションロジック（dispatcher, scheduler_loop, consumer_loop, supervisor, service）
//! - **config**: 設定ファイルと環境変数の読み込み

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
