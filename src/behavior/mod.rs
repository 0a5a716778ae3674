//! Behavior Monitor
//!
//! 実行中プラグインのイベント列から脅威を評価する。

pub mod baseline;
pub mod monitor;
pub mod patterns;
pub mod types;

pub use baseline::{BaselineTracker, RunningStats};
pub use monitor::BehaviorMonitor;
pub use patterns::{builtin_patterns, match_pattern};
pub use types::{
    AnomalyIndicator, AnomalyKind, BehaviorPattern, BehaviorStatistics, PatternMatch,
    PatternStep, ThreatAssessment,
};
