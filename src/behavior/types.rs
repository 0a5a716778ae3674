//! Behavior Monitor Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emergency::EmergencyAction;
use crate::events::SecurityEventType;
use crate::types::{ExecutionId, Severity, ThreatLevel};

/// パターンの1ステップ（同じ種類のイベントが `count` 回）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStep {
    pub event_type: SecurityEventType,
    pub count: usize,
}

/// 振る舞いパターン
///
/// ステップを順に満たすイベント列が時間窓の中に現れたら一致とみなす。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorPattern {
    pub id: String,
    pub description: String,
    pub steps: Vec<PatternStep>,
    pub window_secs: u64,
    pub severity: Severity,
    /// リスクスコアへの寄与
    pub weight: f64,
    /// 推奨アクション
    pub actions: Vec<EmergencyAction>,
}

/// パターンの一致
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub description: String,
    pub severity: Severity,
    pub weight: f64,
    /// 一致に使ったイベント数
    pub event_count: usize,
    pub first_event_at: DateTime<Utc>,
    /// 最後に一致したイベントの時刻
    pub matched_at: DateTime<Utc>,
}

/// 異常の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// 時間窓あたりの件数がベースラインから外れた
    Frequency,
    /// 100ms 未満の間隔で連続したイベント
    TimingBurst,
}

/// 異常の兆候
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyIndicator {
    pub kind: AnomalyKind,
    pub event_type: Option<SecurityEventType>,
    pub z_score: Option<f64>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

/// 脅威評価
///
/// 直近のイベントから毎回計算し直す派生値。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    /// リスクスコア（0-100）
    pub risk_score: f64,
    pub threat_level: ThreatLevel,
    pub indicators: Vec<String>,
    pub patterns: Vec<PatternMatch>,
    pub anomalies: Vec<AnomalyIndicator>,
    /// 優先度の高い順
    pub recommended_actions: Vec<EmergencyAction>,
    pub event_count: usize,
    pub assessed_at: DateTime<Utc>,
}

/// 振る舞い監視の統計
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorStatistics {
    pub executions_tracked: u64,
    pub events_recorded: u64,
    pub assessments: u64,
    pub pattern_matches: u64,
    pub anomalies: u64,
    pub automated_actions: u64,
}
