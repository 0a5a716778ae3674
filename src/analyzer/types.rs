//! Code Analyzer Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Severity, ThreatLevel};

/// 脅威カテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatCategory {
    /// 動的評価（eval、文字列からの関数生成）
    DynamicEvaluation,
    /// プロセス・グローバルへのアクセス
    GlobalAccess,
    /// プロセス起動
    ProcessSpawn,
    /// プロトタイプ改ざん
    PrototypeTampering,
    /// ネットワークアクセス
    NetworkAccess,
    /// ファイルアクセス
    FileAccess,
    /// モジュールの読み込み
    ModuleImport,
    /// インジェクションパターン
    Injection,
    /// 難読化
    Obfuscation,
    /// リソースの浪費（終了条件のないループなど）
    ResourceAbuse,
    /// サイズ・構文の問題
    Structural,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::DynamicEvaluation => "dynamic-evaluation",
            ThreatCategory::GlobalAccess => "global-access",
            ThreatCategory::ProcessSpawn => "process-spawn",
            ThreatCategory::PrototypeTampering => "prototype-tampering",
            ThreatCategory::NetworkAccess => "network-access",
            ThreatCategory::FileAccess => "file-access",
            ThreatCategory::ModuleImport => "module-import",
            ThreatCategory::Injection => "injection",
            ThreatCategory::Obfuscation => "obfuscation",
            ThreatCategory::ResourceAbuse => "resource-abuse",
            ThreatCategory::Structural => "structural",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 検出された脅威
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeThreat {
    /// ルールID
    pub rule_id: String,
    /// カテゴリ
    pub category: ThreatCategory,
    /// 深刻度
    pub severity: Severity,
    /// 説明
    pub description: String,
    /// 行番号（1始まり）
    pub line: Option<usize>,
    /// 列番号（1始まり）
    pub column: Option<usize>,
    /// 該当箇所
    pub snippet: Option<String>,
}

/// 複雑度メトリクス
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityMetrics {
    /// 循環的複雑度（1 + 分岐点の数）
    pub cyclomatic: u32,
    /// 認知的複雑度（制御構造ごとに 1 + ネスト深度）
    pub cognitive: u32,
    /// 最大ネスト深度
    pub max_nesting: u32,
    /// 関数の数
    pub function_count: u32,
    /// 行数
    pub lines: usize,
    /// 文の数
    pub statements: u32,
}

/// 難読化の兆候
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObfuscationSignal {
    /// 確信度（0.0-1.0）
    pub confidence: f64,
    /// 短い識別子の割合
    pub minified_name_ratio: f64,
    /// エスケープシーケンスの密度
    pub escape_density: f64,
    /// 動的プロパティアクセスの割合
    pub dynamic_access_ratio: f64,
    /// 最長行の長さ
    pub longest_line: usize,
    /// 検出された兆候
    pub indicators: Vec<String>,
}

/// 静的解析の結果
///
/// 同じコードには常に同じ結果を返す（コンテンツハッシュでキャッシュされる）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAnalysisResult {
    /// コードのSHA-256（hex）
    pub content_hash: String,
    /// 安全と判定されたか
    pub safe: bool,
    /// 安全性スコア（0-100）
    pub score: f64,
    /// 脅威レベル
    pub threat_level: ThreatLevel,
    /// 検出された脅威
    pub threats: Vec<CodeThreat>,
    /// 複雑度
    pub complexity: ComplexityMetrics,
    /// 難読化の兆候
    pub obfuscation: ObfuscationSignal,
    /// 構文エラー
    pub parse_error: Option<String>,
    /// 解析時刻
    pub analyzed_at: DateTime<Utc>,
    /// 解析時間（ミリ秒）
    pub duration_ms: u64,
}

impl CodeAnalysisResult {
    /// 解析自体が失敗した結果（スコア0、critical）
    pub fn hard_failure(
        content_hash: String,
        rule_id: &str,
        description: impl Into<String>,
        lines: usize,
    ) -> Self {
        let description = description.into();
        Self {
            content_hash,
            safe: false,
            score: 0.0,
            threat_level: ThreatLevel::Critical,
            threats: vec![CodeThreat {
                rule_id: rule_id.to_string(),
                category: ThreatCategory::Structural,
                severity: Severity::Critical,
                description: description.clone(),
                line: None,
                column: None,
                snippet: None,
            }],
            complexity: ComplexityMetrics {
                lines,
                ..Default::default()
            },
            obfuscation: ObfuscationSignal::default(),
            parse_error: Some(description),
            analyzed_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// 深刻度ごとの件数
    pub fn count(&self, severity: Severity) -> usize {
        self.threats.iter().filter(|t| t.severity == severity).count()
    }

    /// critical の脅威を含むか
    pub fn has_critical(&self) -> bool {
        self.count(Severity::Critical) > 0
    }
}
