//! WorkerSettings - core 側の設定値（Duration に変換済み）
//!
//! ファイル / 環境変数からの読み込みは `crate::config` が担当し、
//! ここには検証済みの値だけが入る。

use std::time::Duration;

/// 1 周期で見に行ける最大幅（chrono の範囲に収めるため）
pub const MAX_SCHEDULE_SPAN: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Exchange / queue / routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "tasks".to_string(),
            queue: "tasks_queue".to_string(),
            routing_key: "tasks.routing.key".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// 周期
    pub interval: Duration,
    /// now から先をどこまで見るか
    pub window: Duration,
    /// now から過去をどこまで見るか（取りこぼした期限切れ Task の回収）
    pub lookback: Duration,
    /// store クエリ失敗時の待ち
    pub backoff: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            window: Duration::from_secs(5 * 60),
            lookback: Duration::from_secs(24 * 60 * 60),
            backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub topology: Topology,
    pub scheduler: SchedulerSettings,
    /// 1 コマンドの実行上限
    pub execution_timeout: Duration,
    /// store 呼び出し 1 回の上限
    pub store_timeout: Duration,
    /// 停止要求からループ終了を待つ上限
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            scheduler: SchedulerSettings::default(),
            execution_timeout: Duration::from_secs(60 * 60),
            store_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerSettings {
    /// Returns a description of the first inconsistent value.
    pub fn check(&self) -> Result<(), String> {
        let durations = [
            ("scheduler.interval", self.scheduler.interval),
            ("scheduler.window", self.scheduler.window),
            ("scheduler.backoff", self.scheduler.backoff),
            ("execution_timeout", self.execution_timeout),
            ("store_timeout", self.store_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(format!("{name} must be greater than zero"));
        }

        for (name, span) in [
            ("scheduler.window", self.scheduler.window),
            ("scheduler.lookback", self.scheduler.lookback),
        ] {
            if span > MAX_SCHEDULE_SPAN {
                return Err(format!("{name} is too large"));
            }
        }

        let names = [
            ("topology.exchange", &self.topology.exchange),
            ("topology.queue", &self.topology.queue),
            ("topology.routing_key", &self.topology.routing_key),
        ];
        if let Some((name, _)) = names.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(format!("{name} must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_consistent() {
        let settings = WorkerSettings::default();
        assert!(settings.check().is_ok());
        assert_eq!(settings.topology.exchange, "tasks");
        assert_eq!(settings.topology.queue, "tasks_queue");
        assert_eq!(settings.topology.routing_key, "tasks.routing.key");
        assert_eq!(settings.scheduler.interval, Duration::from_secs(30));
        assert_eq!(settings.scheduler.window, Duration::from_secs(300));
    }

    #[rstest]
    #[case::zero_interval(|s: &mut WorkerSettings| s.scheduler.interval = Duration::ZERO, "scheduler.interval")]
    #[case::zero_store_timeout(|s: &mut WorkerSettings| s.store_timeout = Duration::ZERO, "store_timeout")]
    #[case::empty_queue(|s: &mut WorkerSettings| s.topology.queue = " ".to_string(), "topology.queue")]
    #[case::huge_window(|s: &mut WorkerSettings| s.scheduler.window = MAX_SCHEDULE_SPAN * 2, "scheduler.window")]
    fn rejects_inconsistent_values(
        #[case] tweak: fn(&mut WorkerSettings),
        #[case] field: &str,
    ) {
        let mut settings = WorkerSettings::default();
        tweak(&mut settings);
        let err = settings.check().unwrap_err();
        assert!(err.contains(field), "{err}");
    }

    #[test]
    fn zero_lookback_is_allowed() {
        let mut settings = WorkerSettings::default();
        settings.scheduler.lookback = Duration::ZERO;
        assert!(settings.check().is_ok());
    }
}
