//! Usage Samplers
//!
//! 実行ごとのカウンタ（サンドボックス）とシステム全体の状況（sysinfo）の取得

use async_trait::async_trait;
use std::sync::Mutex;
use sysinfo::{Pid, System};
use tracing::debug;

use super::types::{ExecutionUsageSnapshot, SystemSnapshot};
use crate::types::ExecutionId;

/// 実行ごとの使用量を提供する
#[async_trait]
pub trait UsageSampler: Send + Sync {
    /// 実行の現在のカウンタ（未登録・終了済みなら `None`）
    async fn sample(&self, execution_id: ExecutionId) -> Option<ExecutionUsageSnapshot>;
}

/// システム全体の状況を提供する
pub trait SystemSampler: Send + Sync {
    /// 現在のシステム状況
    fn snapshot(&self) -> SystemSnapshot;
}

/// sysinfo によるシステムサンプラー
pub struct SysinfoSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
    cpu_count: usize,
}

impl SysinfoSampler {
    /// 新しいサンプラーを作成
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            debug!("Current pid unavailable; process RSS will not be sampled");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
            cpu_count: num_cpus::get().max(1),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler for SysinfoSampler {
    fn snapshot(&self) -> SystemSnapshot {
        let load = System::load_average();
        let load_percent = load.one / self.cpu_count as f64 * 100.0;

        let Ok(mut system) = self.system.lock() else {
            // ロック汚染時はロードのみ返す
            return SystemSnapshot {
                load_percent,
                ..Default::default()
            };
        };

        system.refresh_memory();
        let total = system.total_memory();
        let memory_used_percent = if total > 0 {
            system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let process_rss_bytes = self.pid.and_then(|pid| {
            system.refresh_process(pid);
            system.process(pid).map(|process| process.memory())
        });

        SystemSnapshot {
            load_percent,
            memory_used_percent,
            process_rss_bytes,
        }
    }
}

/// 固定値を返すシステムサンプラー
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticSystemSampler(pub SystemSnapshot);

impl SystemSampler for StaticSystemSampler {
    fn snapshot(&self) -> SystemSnapshot {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_sampler_reports_sane_values() {
        let sampler = SysinfoSampler::new();
        let snapshot = sampler.snapshot();
        assert!(snapshot.load_percent >= 0.0);
        assert!((0.0..=100.0).contains(&snapshot.memory_used_percent));
    }

    #[test]
    fn test_static_sampler() {
        let sampler = StaticSystemSampler(SystemSnapshot {
            load_percent: 12.0,
            memory_used_percent: 40.0,
            process_rss_bytes: None,
        });
        assert_eq!(sampler.snapshot().load_percent, 12.0);
    }
}
