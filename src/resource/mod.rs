//! Resource Monitor
//!
//! 実行ごとのメモリ・CPU・実行時間・I/Oを一定間隔でサンプリングし、制限を強制する。

pub mod monitor;
pub mod sampler;
pub mod types;

pub use monitor::{evaluate_sample, MonitoringReport, ResourceMonitor};
pub use sampler::{StaticSystemSampler, SysinfoSampler, SystemSampler, UsageSampler};
pub use types::{
    EmergencyCondition, ExecutionUsageSnapshot, IoCounters, ResourceLimits, ResourceStatistics,
    ResourceType, ResourceUsage, ResourceViolation, SampleEvaluation, SystemSnapshot,
    ViolationSeverity,
};
