//! shuttle-worker
//!
//! 設定を読み、Redis と RabbitMQ に接続して、SIGINT / SIGTERM まで
//! SchedulerLoop と ExecutionConsumer を動かします。

use std::sync::Arc;

use anyhow::Context;
use shuttle_core::app::WorkerBuilder;
use shuttle_core::config::ShuttleConfig;
use shuttle_core::impls::{AmqpBroker, RedisTaskStore};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ShuttleConfig::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .with_target(false)
        .init();

    info!(
        redis = %config.redis.endpoint(),
        amqp = %config.amqp.endpoint(),
        exchange = %config.amqp.exchange,
        queue = %config.amqp.queue,
        "starting shuttle worker"
    );

    let store = RedisTaskStore::connect(&config.redis.url)
        .await
        .with_context(|| format!("failed to connect to redis at {}", config.redis.endpoint()))?;
    let broker = AmqpBroker::connect(&config.amqp.url)
        .await
        .with_context(|| format!("failed to connect to rabbitmq at {}", config.amqp.endpoint()))?;

    let supervisor = WorkerBuilder::new()
        .store(Arc::new(store))
        .broker(Arc::new(broker))
        .settings(config.worker_settings())
        .build()
        .context("failed to build worker")?;

    supervisor
        .run(wait_for_shutdown_signal())
        .await
        .context("worker stopped with an error")?;

    Ok(())
}

/// Ctrl+C か SIGTERM を待つ。ハンドラが入らなければその経路は無視する
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
