//! Security Orchestrator Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::analyzer::CodeAnalysisResult;
use crate::behavior::ThreatAssessment;
use crate::emergency::QuarantineRecord;
use crate::permission::AuditStatistics;
use crate::signature::VerificationResult;
use crate::types::{SandboxLevel, ThreatLevel, TrustLevel};

/// 総合リスク
///
/// low < medium < high < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// 総合スコア（高いほど安全）から決定
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Low
        } else if score >= 60.0 {
            RiskLevel::Medium
        } else if score >= 40.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// セキュリティテスト1件の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityTestResult {
    pub name: String,
    pub passed: bool,
    pub weight: f64,
    pub message: String,
}

/// セキュリティテストの集計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityTestReport {
    pub results: Vec<SecurityTestResult>,
    /// 合格したテストの重み / 全体の重み × 100
    pub score: f64,
}

impl SecurityTestReport {
    pub fn from_results(results: Vec<SecurityTestResult>) -> Self {
        let total: f64 = results.iter().map(|r| r.weight).sum();
        let passed: f64 = results.iter().filter(|r| r.passed).map(|r| r.weight).sum();
        let score = if total > 0.0 { passed / total * 100.0 } else { 0.0 };
        Self { results, score }
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SecurityTestResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// 構成要素ごとのスコア（実行しなかったものは `None`）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub analysis: Option<f64>,
    pub signature: Option<f64>,
    pub testing: Option<f64>,
    pub behavior: Option<f64>,
}

/// 実行を止める要因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionBlocker {
    /// strict モードで総合リスクが critical
    CriticalRisk,
    /// 静的解析で critical な脅威
    CriticalCodeThreat,
    /// 署名が必須なのに無効
    InvalidSignature,
    /// プラグインが隔離中
    Quarantined,
}

impl ExecutionBlocker {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionBlocker::CriticalRisk => "critical-risk",
            ExecutionBlocker::CriticalCodeThreat => "critical-code-threat",
            ExecutionBlocker::InvalidSignature => "invalid-signature",
            ExecutionBlocker::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for ExecutionBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// セキュリティ評価
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAssessment {
    pub id: Uuid,
    pub plugin_id: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub analysis: CodeAnalysisResult,
    pub signature: VerificationResult,
    pub trust_level: TrustLevel,
    pub sandbox_level: SandboxLevel,
    pub tests: Option<SecurityTestReport>,
    /// 過去の実行の振る舞い評価（あれば）
    pub behavior: Option<ThreatAssessment>,
    pub scores: ComponentScores,
    pub overall_score: f64,
    pub risk_level: RiskLevel,
    pub blockers: Vec<ExecutionBlocker>,
    pub execution_allowed: bool,
    pub recommendations: Vec<String>,
}

/// 直近の脅威評価の概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentThreat {
    pub plugin_id: String,
    pub execution_id: Uuid,
    pub threat_level: ThreatLevel,
    pub risk_score: f64,
    pub assessed_at: DateTime<Utc>,
}

/// ホスト全体のセキュリティ状況
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPosture {
    pub generated_at: DateTime<Utc>,
    pub active_executions: usize,
    pub monitored_executions: usize,
    pub quarantined: Vec<QuarantineRecord>,
    pub incident_count: u64,
    pub assessments: usize,
    pub recent_threats: Vec<RecentThreat>,
    pub audit: AuditStatistics,
}
