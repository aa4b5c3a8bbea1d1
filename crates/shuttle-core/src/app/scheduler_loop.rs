//! SchedulerLoop - 期限が来た Task を探して Dispatcher に渡す
//!
//! # フロー（1 周期）
//! 1. `find_scheduled_between(now - lookback, now + window)`
//! 2. pending 以外、まだ期限前のものはスキップ（次の周期で再評価）
//! 3. 残りを Dispatcher で claim → publish（claim 時に保存中の期限をもう一度見る）
//!
//! store クエリが失敗しても止まらない。backoff してから次の周期へ。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app::dispatcher::{DispatchOutcome, Dispatcher, bounded};
use crate::app::settings::SchedulerSettings;
use crate::app::shutdown::ShutdownListener;
use crate::domain::TaskStatus;
use crate::ports::{Clock, StoreError, TaskStore};

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub published: usize,
    /// pending 以外
    pub skipped: usize,
    /// window 内だがまだ期限前
    pub not_due: usize,
    pub lost_claims: usize,
    pub reverted: usize,
    pub failed: usize,
}

pub struct SchedulerLoop {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    store_timeout: std::time::Duration,
}

fn span(d: std::time::Duration) -> chrono::Duration {
    // 上限は WorkerSettings::check で弾いている
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            settings,
            store_timeout,
        }
    }

    fn query_range(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let from = now
            .checked_sub_signed(span(self.settings.lookback))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let to = now
            .checked_add_signed(span(self.settings.window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (from, to)
    }

    /// Run one scheduling pass.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let now = self.clock.now();
        let (from, to) = self.query_range(now);
        let candidates = bounded(
            self.store_timeout,
            self.store.find_scheduled_between(from, to),
        )
        .await?;

        let mut report = CycleReport {
            candidates: candidates.len(),
            ..CycleReport::default()
        };

        for task in candidates {
            if task.status != TaskStatus::Pending {
                report.skipped += 1;
                continue;
            }
            if !task.is_due(now) {
                report.not_due += 1;
                continue;
            }

            match self.dispatcher.dispatch_due(&task, now).await {
                Ok(DispatchOutcome::Published(_)) => {
                    info!(task_id = %task.id, "task dispatched");
                    report.published += 1;
                }
                Ok(DispatchOutcome::LostClaim) => report.lost_claims += 1,
                Ok(DispatchOutcome::Reverted(_)) => report.reverted += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "dispatch failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Loop until `shutdown` fires. An in-flight cycle is always completed.
    pub async fn run(&self, mut shutdown: ShutdownListener) {
        info!(interval = ?self.settings.interval, "scheduler loop started");

        loop {
            if shutdown.is_shutdown() {
                break;
            }

            let pause = match self.run_cycle().await {
                Ok(report) => {
                    if report.candidates > 0 {
                        debug!(?report, "scheduler cycle finished");
                    }
                    self.settings.interval
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?self.settings.backoff, "failed to query scheduled tasks");
                    self.settings.backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.wait() => break,
            }
        }

        info!("scheduler loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::settings::Topology;
    use crate::app::shutdown::Shutdown;
    use crate::domain::{Task, TaskId};
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::{Broker, ExchangeKind, FixedClock};
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryTaskStore>,
        broker: Arc<InMemoryBroker>,
        scheduler: SchedulerLoop,
    }

    async fn fixture(settings: SchedulerSettings) -> Fixture {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let broker = Arc::new(InMemoryBroker::new());
        let topology = Topology::default();
        broker
            .declare_exchange(&topology.exchange, ExchangeKind::Direct)
            .await
            .unwrap();
        broker.declare_queue(&topology.queue).await.unwrap();
        broker
            .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
            .await
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            broker.clone(),
            clock.clone(),
            topology,
            StdDuration::from_secs(1),
        ));
        let scheduler = SchedulerLoop::new(
            store.clone(),
            dispatcher,
            clock.clone(),
            settings,
            StdDuration::from_secs(1),
        );
        Fixture {
            clock,
            store,
            broker,
            scheduler,
        }
    }

    fn task(id: &str) -> Task {
        Task::new(TaskId::parse(id).unwrap(), id, "true")
    }

    async fn status(store: &InMemoryTaskStore, id: &str) -> TaskStatus {
        store
            .get(&TaskId::parse(id).unwrap())
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn only_due_pending_tasks_are_dispatched() {
        let f = fixture(SchedulerSettings::default()).await;
        f.store
            .create(&task("due").with_scheduled_at(t0() - Duration::seconds(1)))
            .await
            .unwrap();
        f.store
            .create(&task("later").with_scheduled_at(t0() + Duration::hours(1)))
            .await
            .unwrap();
        f.store
            .create(&task("soon").with_scheduled_at(t0() + Duration::minutes(1)))
            .await
            .unwrap();
        f.store.create(&task("unscheduled")).await.unwrap();

        let report = f.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.not_due, 1);
        assert_eq!(f.broker.queue_len("tasks_queue").await, 1);

        assert_eq!(status(&f.store, "due").await, TaskStatus::Running);
        assert_eq!(status(&f.store, "later").await, TaskStatus::Pending);
        assert_eq!(status(&f.store, "soon").await, TaskStatus::Pending);
        assert_eq!(status(&f.store, "unscheduled").await, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn not_due_task_is_picked_up_once_the_clock_passes_it() {
        let f = fixture(SchedulerSettings::default()).await;
        f.store
            .create(&task("soon").with_scheduled_at(t0() + Duration::minutes(1)))
            .await
            .unwrap();

        assert_eq!(f.scheduler.run_cycle().await.unwrap().published, 0);
        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.scheduler.run_cycle().await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn overdue_tasks_inside_lookback_are_recovered() {
        let f = fixture(SchedulerSettings::default()).await;
        f.store
            .create(&task("overdue").with_scheduled_at(t0() - Duration::hours(3)))
            .await
            .unwrap();
        f.store
            .create(&task("ancient").with_scheduled_at(t0() - Duration::days(2)))
            .await
            .unwrap();

        let report = f.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.published, 1);
        assert_eq!(status(&f.store, "overdue").await, TaskStatus::Running);
        assert_eq!(status(&f.store, "ancient").await, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn non_pending_candidates_are_skipped() {
        let f = fixture(SchedulerSettings::default()).await;
        for (id, st) in [("r", TaskStatus::Running), ("c", TaskStatus::Completed)] {
            f.store
                .create(&task(id).with_status(st).with_scheduled_at(t0()))
                .await
                .unwrap();
        }

        let report = f.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.published, 0);
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_task_eligible() {
        let f = fixture(SchedulerSettings::default()).await;
        f.store
            .create(&task("due").with_scheduled_at(t0() - Duration::seconds(1)))
            .await
            .unwrap();
        f.broker.fail_next_publishes(1);

        let first = f.scheduler.run_cycle().await.unwrap();
        assert_eq!(first.reverted, 1);
        assert_eq!(status(&f.store, "due").await, TaskStatus::Pending);

        let second = f.scheduler.run_cycle().await.unwrap();
        assert_eq!(second.published, 1);
        assert_eq!(status(&f.store, "due").await, TaskStatus::Running);
    }

    #[tokio::test]
    async fn store_query_failure_is_reported_not_fatal() {
        let f = fixture(SchedulerSettings::default()).await;
        f.store.fail_next_queries(1);
        assert!(f.scheduler.run_cycle().await.is_err());
        assert!(f.scheduler.run_cycle().await.is_ok());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let settings = SchedulerSettings {
            interval: StdDuration::from_secs(3600),
            ..SchedulerSettings::default()
        };
        let f = fixture(settings).await;
        f.store
            .create(&task("due").with_scheduled_at(t0()))
            .await
            .unwrap();

        let shutdown = Shutdown::new();
        let listener = shutdown.listener();
        let scheduler = Arc::new(f.scheduler);
        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(listener).await })
        };

        // 1 周期目は即時に走る
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(f.broker.queue_len("tasks_queue").await, 1);

        shutdown.trigger();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_survives_query_failures() {
        let settings = SchedulerSettings {
            interval: StdDuration::from_millis(10),
            backoff: StdDuration::from_millis(10),
            ..SchedulerSettings::default()
        };
        let f = fixture(settings).await;
        f.store
            .create(&task("due").with_scheduled_at(t0()))
            .await
            .unwrap();
        f.store.fail_next_queries(3);

        let shutdown = Shutdown::new();
        let listener = shutdown.listener();
        let scheduler = Arc::new(f.scheduler);
        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(listener).await })
        };

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.trigger();
        handle.await.unwrap();
        assert_eq!(status(&f.store, "due").await, TaskStatus::Running);
    }
}
