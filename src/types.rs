//! Shared Security Types
//!
//! 全コンポーネントで共有する順序付き分類（信頼レベル・脅威レベル・重要度）

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 実行ID（1回のプラグイン呼び出しごとに生成）
pub type ExecutionId = Uuid;

/// 信頼レベル
///
/// untrusted < basic < verified < trusted < system
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// 信頼なし
    #[default]
    Untrusted,
    /// 基本
    Basic,
    /// 検証済み
    Verified,
    /// 信頼済み
    Trusted,
    /// システム
    System,
}

impl TrustLevel {
    /// 文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Basic => "basic",
            TrustLevel::Verified => "verified",
            TrustLevel::Trusted => "trusted",
            TrustLevel::System => "system",
        }
    }

    /// 信頼レベルに応じたサンドボックスの厳格さ
    pub fn sandbox_level(&self) -> SandboxLevel {
        match self {
            TrustLevel::Untrusted | TrustLevel::Basic => SandboxLevel::Strict,
            TrustLevel::Verified => SandboxLevel::Standard,
            TrustLevel::Trusted | TrustLevel::System => SandboxLevel::Relaxed,
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// サンドボックスレベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    /// 厳格（書き込み不可・低い上限）
    Strict,
    /// 標準
    Standard,
    /// 緩和
    Relaxed,
}

/// 脅威レベル
///
/// none < low < medium < high < critical
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    /// 脅威なし
    #[default]
    None,
    /// 低
    Low,
    /// 中
    Medium,
    /// 高
    High,
    /// 緊急
    Critical,
}

impl ThreatLevel {
    /// リスクスコア（0-100、高いほど危険）から脅威レベルを決定
    pub fn from_risk_score(score: f64) -> Self {
        if score >= 80.0 {
            ThreatLevel::Critical
        } else if score >= 60.0 {
            ThreatLevel::High
        } else if score >= 40.0 {
            ThreatLevel::Medium
        } else if score >= 20.0 {
            ThreatLevel::Low
        } else {
            ThreatLevel::None
        }
    }

    /// 文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 深刻度
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 情報
    #[default]
    Info,
    /// 低
    Low,
    /// 中
    Medium,
    /// 高
    High,
    /// 緊急
    Critical,
}

impl Severity {
    /// 文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// 対応する脅威レベル
    pub fn threat_level(&self) -> ThreatLevel {
        match self {
            Severity::Info => ThreatLevel::None,
            Severity::Low => ThreatLevel::Low,
            Severity::Medium => ThreatLevel::Medium,
            Severity::High => ThreatLevel::High,
            Severity::Critical => ThreatLevel::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_level_ordering() {
        assert!(TrustLevel::Untrusted < TrustLevel::Basic);
        assert!(TrustLevel::Verified < TrustLevel::Trusted);
        assert!(TrustLevel::Trusted < TrustLevel::System);
    }

    #[test]
    fn test_threat_level_bands() {
        assert_eq!(ThreatLevel::from_risk_score(95.0), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::from_risk_score(80.0), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::from_risk_score(79.9), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_risk_score(45.0), ThreatLevel::Medium);
        assert_eq!(ThreatLevel::from_risk_score(20.0), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_risk_score(0.0), ThreatLevel::None);
    }

    #[test]
    fn test_trust_level_serde() {
        let json = serde_json::to_string(&TrustLevel::Verified).unwrap();
        assert_eq!(json, "\"verified\"");
        let parsed: TrustLevel = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(parsed, TrustLevel::System);
    }
}
