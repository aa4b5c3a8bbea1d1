//! WorkerBuilder - Supervisor の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - store / broker が無ければ `BuildError::Missing`
//! - 設定値が矛盾していれば `BuildError::InvalidSettings`
//! - executor / clock は省略可（ShellExecutor / SystemClock）

use std::sync::Arc;

use crate::app::consumer_loop::ExecutionConsumer;
use crate::app::dispatcher::Dispatcher;
use crate::app::scheduler_loop::SchedulerLoop;
use crate::app::settings::WorkerSettings;
use crate::app::supervisor::Supervisor;
use crate::impls::ShellExecutor;
use crate::ports::{Broker, Clock, CommandExecutor, SystemClock, TaskStore};

/// WorkerBuilder は Supervisor を構築
///
/// # 使用例
/// ```ignore
/// let supervisor = WorkerBuilder::new()
///     .store(store)
///     .broker(broker)
///     .settings(settings)
///     .build()?;
/// supervisor.run(shutdown_signal()).await?;
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    store: Option<Arc<dyn TaskStore>>,
    broker: Option<Arc<dyn Broker>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    settings: WorkerSettings,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}")]
    Missing(&'static str),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Result<Supervisor, BuildError> {
        let store = self.store.ok_or(BuildError::Missing("task store"))?;
        let broker = self.broker.ok_or(BuildError::Missing("broker"))?;
        self.settings.check().map_err(BuildError::InvalidSettings)?;

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ShellExecutor::new()) as Arc<dyn CommandExecutor>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let settings = self.settings;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&clock),
            settings.topology.clone(),
            settings.store_timeout,
        ));
        let scheduler = SchedulerLoop::new(
            Arc::clone(&store),
            dispatcher,
            clock,
            settings.scheduler.clone(),
            settings.store_timeout,
        );
        let consumer = ExecutionConsumer::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            executor,
            settings.topology.queue.clone(),
            settings.execution_timeout,
            settings.store_timeout,
        );

        Ok(Supervisor::new(
            store,
            broker,
            scheduler,
            consumer,
            settings.topology,
            settings.shutdown_timeout,
        ))
    }
}
