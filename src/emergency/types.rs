//! Emergency Controller Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::types::{ExecutionId, Severity};

/// 緊急対応アクション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyAction {
    /// 実行の強制終了
    Terminate,
    /// 一時停止
    Suspend,
    /// 書き込み系の仲介APIを拒否
    Restrict,
    /// すべての仲介APIを拒否
    Isolate,
    /// 実行速度を落とす
    Throttle,
    /// プラグインを隔離（以降の実行をすべて拒否）
    Quarantine,
    /// フォレンジック情報の収集
    ForensicCapture,
    /// インシデントとプラグイン状態の退避
    Backup,
    /// アラート送信
    Alert,
    /// 監視継続
    Monitor,
}

impl EmergencyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyAction::Terminate => "terminate",
            EmergencyAction::Suspend => "suspend",
            EmergencyAction::Restrict => "restrict",
            EmergencyAction::Isolate => "isolate",
            EmergencyAction::Throttle => "throttle",
            EmergencyAction::Quarantine => "quarantine",
            EmergencyAction::ForensicCapture => "forensic-capture",
            EmergencyAction::Backup => "backup",
            EmergencyAction::Alert => "alert",
            EmergencyAction::Monitor => "monitor",
        }
    }

    /// 優先度（大きいほど強い措置）
    pub fn priority(&self) -> u8 {
        match self {
            EmergencyAction::Terminate => 100,
            EmergencyAction::Quarantine => 90,
            EmergencyAction::Isolate => 80,
            EmergencyAction::Suspend => 70,
            EmergencyAction::Restrict => 60,
            EmergencyAction::Throttle => 50,
            EmergencyAction::ForensicCapture => 40,
            EmergencyAction::Backup => 30,
            EmergencyAction::Alert => 20,
            EmergencyAction::Monitor => 10,
        }
    }

    /// 振る舞い監視から自動で発動できるか（実行単位の制御のみ）
    pub fn is_automatable(&self) -> bool {
        matches!(
            self,
            EmergencyAction::Terminate
                | EmergencyAction::Suspend
                | EmergencyAction::Restrict
                | EmergencyAction::Isolate
                | EmergencyAction::Throttle
        )
    }
}

impl fmt::Display for EmergencyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 緊急対応のきっかけ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyTrigger {
    ResourceExhaustion,
    InfiniteLoop,
    SuspiciousBehavior,
    SandboxEscape,
    DataExfiltration,
    SecurityViolation,
    Manual,
}

impl EmergencyTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyTrigger::ResourceExhaustion => "resource-exhaustion",
            EmergencyTrigger::InfiniteLoop => "infinite-loop",
            EmergencyTrigger::SuspiciousBehavior => "suspicious-behavior",
            EmergencyTrigger::SandboxEscape => "sandbox-escape",
            EmergencyTrigger::DataExfiltration => "data-exfiltration",
            EmergencyTrigger::SecurityViolation => "security-violation",
            EmergencyTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for EmergencyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 実行ごとの緊急対応状態
///
/// Active → IncidentTriggered → ActionExecution → Resolved | Quarantined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyState {
    Active,
    IncidentTriggered,
    ActionExecution,
    Resolved,
    Quarantined,
}

/// 緊急対応の要求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    pub trigger: EmergencyTrigger,
    pub severity: Severity,
    pub description: String,
}

/// アクション1件の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: EmergencyAction,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

/// 緊急対応の結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyResponse {
    pub success: bool,
    pub incident_id: Option<Uuid>,
    pub actions: Vec<ActionOutcome>,
    pub message: String,
}

impl EmergencyResponse {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            incident_id: None,
            actions: Vec::new(),
            message: message.into(),
        }
    }
}

/// フォレンジック情報
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForensicArtifact {
    pub source: String,
    pub collected_at: DateTime<Utc>,
    pub data: Value,
}

/// インシデント
///
/// 作成後はフォレンジック情報の追加以外で変更しない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyIncident {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    pub trigger: EmergencyTrigger,
    pub severity: Severity,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub actions: Vec<ActionOutcome>,
    pub final_state: EmergencyState,
    #[serde(default)]
    pub forensics: Vec<ForensicArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

impl EmergencyIncident {
    pub fn summary(&self) -> IncidentSummary {
        IncidentSummary {
            incident_id: self.id,
            execution_id: self.execution_id,
            plugin_id: self.plugin_id.clone(),
            trigger: self.trigger,
            severity: self.severity,
            final_state: self.final_state,
            created_at: self.created_at,
            actions: self.actions.iter().map(|a| a.action).collect(),
        }
    }
}

/// ホスト通知用のインシデント概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub incident_id: Uuid,
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    pub trigger: EmergencyTrigger,
    pub severity: Severity,
    pub final_state: EmergencyState,
    pub created_at: DateTime<Utc>,
    pub actions: Vec<EmergencyAction>,
}

/// 隔離レコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub plugin_id: String,
    pub reason: String,
    pub incident_id: Option<Uuid>,
    pub quarantined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_priority_order() {
        let mut actions = vec![
            EmergencyAction::Alert,
            EmergencyAction::Restrict,
            EmergencyAction::Isolate,
            EmergencyAction::Terminate,
        ];
        actions.sort_by_key(|a| std::cmp::Reverse(a.priority()));
        assert_eq!(actions[0], EmergencyAction::Terminate);
        assert_eq!(actions[1], EmergencyAction::Isolate);
        assert!(!EmergencyAction::Alert.is_automatable());
        assert!(EmergencyAction::Restrict.is_automatable());
    }

    #[test]
    fn test_trigger_serde() {
        let json = serde_json::to_string(&EmergencyTrigger::InfiniteLoop).unwrap();
        assert_eq!(json, "\"infinite-loop\"");
    }
}
