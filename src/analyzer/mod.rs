//! Code Analyzer
//!
//! プラグインのソースを構文解析し、危険な構文・複雑度・難読化からスコアを付ける。
//! 結果はコンテンツハッシュでキャッシュする（同じコードは常に同じ結果）。

pub mod obfuscation;
pub mod rules;
pub mod types;

pub use rules::{parser_engine, StringRule};
pub use types::{CodeAnalysisResult, CodeThreat, ComplexityMetrics, ObfuscationSignal, ThreatCategory};

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::AnalyzerConfig;
use crate::plugin::content_hash;
use crate::types::{Severity, ThreatLevel};

/// 深刻度ごとの減点
fn severity_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 30.0,
        Severity::High => 20.0,
        Severity::Medium => 10.0,
        Severity::Low => 5.0,
        Severity::Info => 0.0,
    }
}

/// 件数とスコア帯から脅威レベルを決定
pub fn derive_threat_level(threats: &[CodeThreat], score: f64) -> ThreatLevel {
    let has = |severity: Severity| threats.iter().any(|t| t.severity == severity);

    if has(Severity::Critical) || score < 30.0 {
        ThreatLevel::Critical
    } else if has(Severity::High) || score < 50.0 {
        ThreatLevel::High
    } else if has(Severity::Medium) || score < 70.0 {
        ThreatLevel::Medium
    } else if has(Severity::Low) || score < 90.0 {
        ThreatLevel::Low
    } else {
        ThreatLevel::None
    }
}

/// キャッシュを使わずに解析する（同期・純粋）
pub fn analyze_source(code: &str, config: &AnalyzerConfig) -> CodeAnalysisResult {
    let started = Instant::now();
    let hash = content_hash(code);
    let lines = code.lines().count();

    if code.len() > config.max_code_size_bytes {
        return CodeAnalysisResult::hard_failure(
            hash,
            "SIZE-001",
            format!(
                "code is {} bytes, exceeding the {} byte limit",
                code.len(),
                config.max_code_size_bytes
            ),
            lines,
        );
    }
    if lines > config.max_lines {
        return CodeAnalysisResult::hard_failure(
            hash,
            "SIZE-002",
            format!("code has {} lines, exceeding the {} line limit", lines, config.max_lines),
            lines,
        );
    }

    let ast = match parser_engine().compile(code) {
        Ok(ast) => ast,
        Err(e) => {
            return CodeAnalysisResult::hard_failure(
                hash,
                "PARSE-001",
                format!("parse error: {}", e),
                lines,
            )
        }
    };

    let mut findings = rules::inspect(&ast, &config.blocked_functions);
    findings.complexity.lines = lines;
    let obfuscation = obfuscation::measure(code, &findings);

    let mut threats = findings.threats;
    if obfuscation.confidence > config.obfuscation_threshold {
        threats.push(CodeThreat {
            rule_id: "OBF-001".to_string(),
            category: ThreatCategory::Obfuscation,
            severity: Severity::High,
            description: format!(
                "Code appears obfuscated (confidence {:.2}): {}",
                obfuscation.confidence,
                obfuscation.indicators.join("; ")
            ),
            line: None,
            column: None,
            snippet: None,
        });
    }

    let complexity = findings.complexity;
    let mut score = 100.0;
    for threat in &threats {
        score -= severity_penalty(threat.severity);
    }

    if complexity.cyclomatic > config.complexity_threshold {
        score -= ((complexity.cyclomatic - config.complexity_threshold) as f64 / 2.0).min(15.0) + 5.0;
    }
    if complexity.cognitive > config.cognitive_threshold {
        score -= ((complexity.cognitive - config.cognitive_threshold) as f64 / 4.0).min(10.0) + 5.0;
    }
    if complexity.max_nesting > config.nesting_threshold {
        score -= 5.0 * (complexity.max_nesting - config.nesting_threshold) as f64;
    }
    if obfuscation.confidence > config.obfuscation_threshold {
        let excess = (obfuscation.confidence - config.obfuscation_threshold)
            / (1.0 - config.obfuscation_threshold).max(f64::EPSILON);
        score -= 10.0 * excess.min(1.0);
    }
    let score = score.clamp(0.0, 100.0);

    let threat_level = derive_threat_level(&threats, score);
    let safe = threat_level <= ThreatLevel::Medium
        && !threats.iter().any(|t| t.severity >= Severity::High);

    CodeAnalysisResult {
        content_hash: hash,
        safe,
        score,
        threat_level,
        threats,
        complexity,
        obfuscation,
        parse_error: None,
        analyzed_at: Utc::now(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// キャッシュ（挿入順で古いものから追い出す）
#[derive(Default)]
struct AnalysisCache {
    entries: HashMap<String, Arc<CodeAnalysisResult>>,
    order: VecDeque<String>,
}

/// 静的コード解析器
pub struct CodeAnalyzer {
    config: AnalyzerConfig,
    cache: Arc<RwLock<AnalysisCache>>,
}

impl CodeAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            cache: Arc::new(RwLock::new(AnalysisCache::default())),
        }
    }

    /// コードを解析（キャッシュ優先、時間超過は失敗扱い）
    #[instrument(skip(self, code), fields(bytes = code.len()))]
    pub async fn analyze(&self, code: &str) -> Arc<CodeAnalysisResult> {
        let hash = content_hash(code);
        if let Some(cached) = self.cache.read().await.entries.get(&hash) {
            debug!("Analysis cache hit");
            return cached.clone();
        }

        let owned = code.to_string();
        let config = self.config.clone();
        let budget = Duration::from_millis(self.config.analysis_timeout_ms);
        let task = tokio::task::spawn_blocking(move || analyze_source(&owned, &config));

        let result = match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Analysis task failed: {}", e);
                // 失敗結果はキャッシュしない
                return Arc::new(CodeAnalysisResult::hard_failure(
                    hash,
                    "ANALYSIS-FAILED",
                    format!("analysis failed: {}", e),
                    code.lines().count(),
                ));
            }
            Err(_) => {
                warn!("Analysis exceeded {:?}; failing closed", budget);
                return Arc::new(CodeAnalysisResult::hard_failure(
                    hash,
                    "ANALYSIS-TIMEOUT",
                    format!("analysis exceeded {} ms", self.config.analysis_timeout_ms),
                    code.lines().count(),
                ));
            }
        };

        info!(
            score = result.score,
            threat_level = %result.threat_level,
            threats = result.threats.len(),
            "Code analysis completed"
        );

        let result = Arc::new(result);
        self.insert(hash, result.clone()).await;
        result
    }

    async fn insert(&self, hash: String, result: Arc<CodeAnalysisResult>) {
        let capacity = self.config.cache_capacity;
        if capacity == 0 {
            return;
        }
        let mut cache = self.cache.write().await;
        if cache.entries.insert(hash.clone(), result).is_none() {
            cache.order.push_back(hash);
        }
        while cache.order.len() > capacity {
            if let Some(oldest) = cache.order.pop_front() {
                cache.entries.remove(&oldest);
            }
        }
    }

    /// キャッシュ件数
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.entries.len()
    }

    /// キャッシュを破棄
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.entries.clear();
        cache.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> CodeAnalyzer {
        CodeAnalyzer::new(AnalyzerConfig::default())
    }

    #[tokio::test]
    async fn test_eval_is_unsafe() {
        let result = analyzer().analyze(r#"fn run(x) { eval(x) }"#).await;
        assert!(!result.safe);
        assert!(result.threat_level >= ThreatLevel::High);
        assert!(result.score <= 70.0);
    }

    #[tokio::test]
    async fn test_clean_code_is_safe() {
        let result = analyzer()
            .analyze(
                r#"
                fn run(name) {
                    log("hello " + name);
                    storage_set("last", name);
                    name.len()
                }
                "#,
            )
            .await;
        assert!(result.safe, "{:?}", result.threats);
        assert_eq!(result.score, 100.0);
        assert_eq!(result.threat_level, ThreatLevel::None);
    }

    #[tokio::test]
    async fn test_parse_failure_is_hard_failure() {
        let result = analyzer().analyze("fn run( {").await;
        assert!(!result.safe);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.threat_level, ThreatLevel::Critical);
        assert!(result.parse_error.is_some());
    }

    #[tokio::test]
    async fn test_size_limits() {
        let analyzer = CodeAnalyzer::new(AnalyzerConfig {
            max_lines: 3,
            ..Default::default()
        });
        let result = analyzer.analyze("let a = 1;\nlet b = 2;\nlet c = 3;\nlet d = 4;").await;
        assert_eq!(result.score, 0.0);
        assert_eq!(result.threats[0].rule_id, "SIZE-002");
    }

    #[tokio::test]
    async fn test_results_are_cached_by_content() {
        let analyzer = analyzer();
        let first = analyzer.analyze("fn run() { 1 }").await;
        let second = analyzer.analyze("fn run() { 1 }").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(analyzer.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_blocked_functions_from_config() {
        let analyzer = CodeAnalyzer::new(AnalyzerConfig {
            blocked_functions: vec!["dangerous".to_string()],
            ..Default::default()
        });
        let result = analyzer.analyze("fn run() { dangerous() }").await;
        assert_eq!(result.threat_level, ThreatLevel::Critical);
        assert!(!result.safe);
    }

    #[test]
    fn test_threat_level_bands() {
        assert_eq!(derive_threat_level(&[], 95.0), ThreatLevel::None);
        assert_eq!(derive_threat_level(&[], 85.0), ThreatLevel::Low);
        assert_eq!(derive_threat_level(&[], 25.0), ThreatLevel::Critical);
    }
}
