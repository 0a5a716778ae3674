//! Resource Monitor Types
//!
//! リソース制限・使用状況サンプル・違反レコードの型定義

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::{ExecutionId, Severity};

/// リソース制限設定
///
/// 制限値ちょうどは違反ではない（`measured > limit` のみ違反）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// 最大ヒープ使用量（バイト）
    pub max_heap_bytes: u64,
    /// 最大RSS（バイト、プロセス全体。未設定なら監視のみ）
    pub max_rss_bytes: Option<u64>,
    /// 最大外部メモリ（バッファ中のI/O、バイト）
    pub max_external_bytes: u64,
    /// 最大CPU使用率（%、1コア基準）
    pub max_cpu_percent: f64,
    /// 最大累積CPU時間（ミリ秒）
    pub max_cpu_time_ms: u64,
    /// 最大実行時間（ミリ秒）
    pub max_execution_time_ms: u64,
    /// 強制終了する実行時間（ミリ秒）
    pub hard_timeout_ms: u64,
    /// 最大読み込みバイト数
    pub max_io_read_bytes: u64,
    /// 最大書き込みバイト数
    pub max_io_write_bytes: u64,
    /// 最大I/O操作回数
    pub max_io_operations: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_heap_bytes: 64 * 1024 * 1024,
            max_rss_bytes: None,
            max_external_bytes: 16 * 1024 * 1024,
            max_cpu_percent: 100.0,
            max_cpu_time_ms: 30_000,
            max_execution_time_ms: 5_000,
            hard_timeout_ms: 10_000,
            max_io_read_bytes: 64 * 1024 * 1024,
            max_io_write_bytes: 64 * 1024 * 1024,
            max_io_operations: 10_000,
        }
    }
}

impl ResourceLimits {
    /// リソース制限を検証
    pub fn validate(&self) -> Result<(), String> {
        if self.max_cpu_percent <= 0.0 || self.max_cpu_percent > 100.0 {
            return Err(format!(
                "Invalid CPU limit: {}% (must be 0 < cpu <= 100)",
                self.max_cpu_percent
            ));
        }

        if self.max_heap_bytes == 0 {
            return Err("Invalid heap limit: 0 bytes".to_string());
        }

        if self.max_execution_time_ms == 0 {
            return Err("Invalid execution time limit: 0 ms".to_string());
        }

        if self.hard_timeout_ms < self.max_execution_time_ms {
            return Err(format!(
                "Hard timeout {} ms is shorter than execution limit {} ms",
                self.hard_timeout_ms, self.max_execution_time_ms
            ));
        }

        Ok(())
    }
}

/// I/Oカウンタ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoCounters {
    /// 読み込みバイト数
    pub read_bytes: u64,
    /// 書き込みバイト数
    pub write_bytes: u64,
    /// 読み込み操作回数
    pub read_ops: u64,
    /// 書き込み操作回数
    pub write_ops: u64,
}

impl IoCounters {
    /// 操作回数の合計
    pub fn total_operations(&self) -> u64 {
        self.read_ops + self.write_ops
    }
}

/// 実行ごとの生カウンタ（サンドボックスが提供）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUsageSnapshot {
    /// プラグインID
    pub plugin_id: String,
    /// 追跡中のヒープ使用量（仲介ストレージ上の値）
    pub heap_bytes: u64,
    /// バッファ中のI/Oバイト数
    pub external_bytes: u64,
    /// 累積CPU時間（ブロック・停止時間を除く実行時間）
    pub cpu_time_ms: u64,
    /// 経過時間
    pub elapsed_ms: u64,
    /// I/Oカウンタ
    pub io: IoCounters,
    /// インタプリタの操作回数
    pub operations: u64,
}

/// システム全体の状況
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// 1分平均ロード ÷ CPU数（%）
    pub load_percent: f64,
    /// メモリ使用率（%）
    pub memory_used_percent: f64,
    /// ホストプロセスのRSS（バイト）
    pub process_rss_bytes: Option<u64>,
}

/// リソース使用状況サンプル
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// 実行ID
    pub execution_id: ExecutionId,
    /// 取得時刻
    pub timestamp: DateTime<Utc>,
    /// ヒープ使用量
    pub heap_bytes: u64,
    /// RSS
    pub rss_bytes: Option<u64>,
    /// 外部メモリ
    pub external_bytes: u64,
    /// CPU使用率（%、前回サンプルからの区間）
    pub cpu_percent: f64,
    /// 累積CPU時間
    pub cpu_time_ms: u64,
    /// 経過時間
    pub elapsed_ms: u64,
    /// I/Oカウンタ
    pub io: IoCounters,
    /// システム状況
    pub system: Option<SystemSnapshot>,
}

impl ResourceUsage {
    /// 空のサンプル
    pub fn empty(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            timestamp: Utc::now(),
            heap_bytes: 0,
            rss_bytes: None,
            external_bytes: 0,
            cpu_percent: 0.0,
            cpu_time_ms: 0,
            elapsed_ms: 0,
            io: IoCounters::default(),
            system: None,
        }
    }

    /// リソース使用状況が制限を超えているかチェック
    pub fn exceeds_limits(&self, limits: &ResourceLimits) -> bool {
        !self.get_violations(limits).is_empty()
    }

    /// 制限超過の詳細を取得（`(種別, 測定値, 制限値)`）
    pub fn get_violations(&self, limits: &ResourceLimits) -> Vec<(ResourceType, f64, f64)> {
        let mut violations = Vec::new();

        let mut check = |resource: ResourceType, measured: f64, limit: f64| {
            if measured > limit {
                violations.push((resource, measured, limit));
            }
        };

        check(
            ResourceType::HeapMemory,
            self.heap_bytes as f64,
            limits.max_heap_bytes as f64,
        );
        if let (Some(rss), Some(limit)) = (self.rss_bytes, limits.max_rss_bytes) {
            check(ResourceType::RssMemory, rss as f64, limit as f64);
        }
        check(
            ResourceType::ExternalMemory,
            self.external_bytes as f64,
            limits.max_external_bytes as f64,
        );
        check(ResourceType::Cpu, self.cpu_percent, limits.max_cpu_percent);
        check(
            ResourceType::CpuTime,
            self.cpu_time_ms as f64,
            limits.max_cpu_time_ms as f64,
        );
        check(
            ResourceType::ExecutionTime,
            self.elapsed_ms as f64,
            limits.max_execution_time_ms as f64,
        );
        check(
            ResourceType::IoRead,
            self.io.read_bytes as f64,
            limits.max_io_read_bytes as f64,
        );
        check(
            ResourceType::IoWrite,
            self.io.write_bytes as f64,
            limits.max_io_write_bytes as f64,
        );
        check(
            ResourceType::IoOperations,
            self.io.total_operations() as f64,
            limits.max_io_operations as f64,
        );

        violations
    }
}

/// リソース種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    HeapMemory,
    RssMemory,
    ExternalMemory,
    Cpu,
    CpuTime,
    ExecutionTime,
    IoRead,
    IoWrite,
    IoOperations,
    SystemLoad,
    SystemMemory,
}

impl ResourceType {
    /// 文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::HeapMemory => "heap-memory",
            ResourceType::RssMemory => "rss-memory",
            ResourceType::ExternalMemory => "external-memory",
            ResourceType::Cpu => "cpu",
            ResourceType::CpuTime => "cpu-time",
            ResourceType::ExecutionTime => "execution-time",
            ResourceType::IoRead => "io-read",
            ResourceType::IoWrite => "io-write",
            ResourceType::IoOperations => "io-operations",
            ResourceType::SystemLoad => "system-load",
            ResourceType::SystemMemory => "system-memory",
        }
    }

    /// メモリ系かどうか
    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            ResourceType::HeapMemory
                | ResourceType::RssMemory
                | ResourceType::ExternalMemory
                | ResourceType::SystemMemory
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 違反の深刻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    /// 制限の120%以下
    Warning,
    /// 制限の150%以下
    Limit,
    /// 制限の150%超
    Critical,
    /// 緊急終了条件
    Emergency,
}

impl ViolationSeverity {
    /// 超過率から深刻度を決定
    pub fn from_ratio(measured: f64, limit: f64) -> Self {
        if limit <= 0.0 {
            return ViolationSeverity::Critical;
        }
        let ratio = measured / limit;
        if ratio <= 1.2 {
            ViolationSeverity::Warning
        } else if ratio <= 1.5 {
            ViolationSeverity::Limit
        } else {
            ViolationSeverity::Critical
        }
    }

    /// セキュリティイベントの深刻度
    pub fn severity(&self) -> Severity {
        match self {
            ViolationSeverity::Warning => Severity::Low,
            ViolationSeverity::Limit => Severity::Medium,
            ViolationSeverity::Critical => Severity::High,
            ViolationSeverity::Emergency => Severity::Critical,
        }
    }
}

/// リソース違反レコード
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    /// 違反ID
    pub id: Uuid,
    /// 実行ID
    pub execution_id: ExecutionId,
    /// プラグインID
    pub plugin_id: String,
    /// リソース種別
    pub resource_type: ResourceType,
    /// 深刻度
    pub severity: ViolationSeverity,
    /// 測定値
    pub measured: f64,
    /// 制限値（緊急条件ではしきい値）
    pub limit: f64,
    /// 発生時刻
    pub timestamp: DateTime<Utc>,
    /// メッセージ
    pub message: String,
}

/// 緊急終了の理由
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyCondition {
    /// リソース種別
    pub resource_type: ResourceType,
    /// 測定値
    pub measured: f64,
    /// しきい値
    pub threshold: f64,
}

/// 1サンプルの評価結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleEvaluation {
    /// 違反（種別・深刻度・測定値・制限値）
    pub violations: Vec<(ResourceType, ViolationSeverity, f64, f64)>,
    /// スロットルすべきか
    pub throttle: bool,
    /// 緊急終了条件
    pub emergency: Option<EmergencyCondition>,
}

impl SampleEvaluation {
    /// 違反がないか
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.emergency.is_none() && !self.throttle
    }
}

/// リソース監視統計
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// 平均CPU使用率（%）
    pub avg_cpu_percent: f64,
    /// 最大CPU使用率（%）
    pub max_cpu_percent: f64,
    /// 平均ヒープ使用量
    pub avg_heap_bytes: u64,
    /// 最大ヒープ使用量
    pub peak_heap_bytes: u64,
    /// 最大外部メモリ
    pub peak_external_bytes: u64,
    /// サンプル数
    pub sample_count: usize,
    /// 制限違反回数
    pub violation_count: usize,
    /// スロットル回数
    pub throttle_count: usize,
}

impl ResourceStatistics {
    /// 統計情報を更新
    pub fn record(&mut self, usage: &ResourceUsage, violated: bool) {
        self.sample_count += 1;

        let n = self.sample_count as f64;
        self.avg_cpu_percent = (self.avg_cpu_percent * (n - 1.0) + usage.cpu_percent) / n;
        self.avg_heap_bytes =
            ((self.avg_heap_bytes as f64 * (n - 1.0) + usage.heap_bytes as f64) / n) as u64;

        if usage.cpu_percent > self.max_cpu_percent {
            self.max_cpu_percent = usage.cpu_percent;
        }
        self.peak_heap_bytes = self.peak_heap_bytes.max(usage.heap_bytes);
        self.peak_external_bytes = self.peak_external_bytes.max(usage.external_bytes);

        if violated {
            self.violation_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_limits_validation() {
        assert!(ResourceLimits::default().validate().is_ok());

        let invalid_cpu = ResourceLimits {
            max_cpu_percent: 101.0,
            ..Default::default()
        };
        assert!(invalid_cpu.validate().is_err());

        let invalid_timeout = ResourceLimits {
            max_execution_time_ms: 2_000,
            hard_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(invalid_timeout.validate().is_err());
    }

    #[test]
    fn test_exactly_at_limit_is_not_a_violation() {
        let limits = ResourceLimits {
            max_heap_bytes: 1_000,
            ..Default::default()
        };
        let mut usage = ResourceUsage::empty(Uuid::new_v4());
        usage.heap_bytes = 1_000;
        assert!(!usage.exceeds_limits(&limits));

        usage.heap_bytes = 1_001;
        let violations = usage.get_violations(&limits);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].0, ResourceType::HeapMemory);
    }

    #[test]
    fn test_violation_severity_bands() {
        assert_eq!(
            ViolationSeverity::from_ratio(110.0, 100.0),
            ViolationSeverity::Warning
        );
        assert_eq!(
            ViolationSeverity::from_ratio(120.0, 100.0),
            ViolationSeverity::Warning
        );
        assert_eq!(
            ViolationSeverity::from_ratio(140.0, 100.0),
            ViolationSeverity::Limit
        );
        assert_eq!(
            ViolationSeverity::from_ratio(151.0, 100.0),
            ViolationSeverity::Critical
        );
    }

    #[test]
    fn test_statistics_record() {
        let mut stats = ResourceStatistics::default();
        let mut usage = ResourceUsage::empty(Uuid::new_v4());
        usage.cpu_percent = 40.0;
        usage.heap_bytes = 100;
        stats.record(&usage, false);
        usage.cpu_percent = 60.0;
        usage.heap_bytes = 300;
        stats.record(&usage, true);

        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.avg_cpu_percent, 50.0);
        assert_eq!(stats.max_cpu_percent, 60.0);
        assert_eq!(stats.peak_heap_bytes, 300);
        assert_eq!(stats.violation_count, 1);
    }
}
