//! Obfuscation Heuristics
//!
//! 短い識別子の割合・エスケープシーケンス密度・動的プロパティアクセスから確信度を出す。

use regex::Regex;
use std::sync::OnceLock;

use super::rules::Findings;
use super::types::ObfuscationSignal;

/// 割合を出すのに必要な識別子の最小数
const MIN_IDENTIFIERS: usize = 6;
/// これを超える行は難読化の兆候とみなす
const LONG_LINE: usize = 300;
/// ループ変数として一般的な短い名前
const CONVENTIONAL_SHORT_NAMES: &[&str] = &["i", "j", "k", "x", "y", "id"];

fn escape_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\\(x[0-9A-Fa-f]{2}|u[0-9A-Fa-f]{4}|U[0-9A-Fa-f]{8})").ok())
        .as_ref()
}

/// 難読化シグナルを計算
pub fn measure(source: &str, findings: &Findings) -> ObfuscationSignal {
    let mut indicators = Vec::new();

    let total_names = findings.identifiers.len();
    let short_names = findings
        .identifiers
        .iter()
        .filter(|name| name.chars().count() <= 2 && !CONVENTIONAL_SHORT_NAMES.contains(&name.as_str()))
        .count();
    let minified_name_ratio = if total_names >= MIN_IDENTIFIERS {
        short_names as f64 / total_names as f64
    } else {
        0.0
    };
    if minified_name_ratio > 0.5 {
        indicators.push(format!(
            "{} of {} identifiers are one or two characters",
            short_names, total_names
        ));
    }

    // エスケープが占める文字数の割合
    let escape_chars: usize = escape_pattern()
        .map(|pattern| pattern.find_iter(source).map(|m| m.len()).sum())
        .unwrap_or(0);
    let escape_density = if source.is_empty() {
        0.0
    } else {
        escape_chars as f64 / source.len() as f64
    };
    if escape_density > 0.1 {
        indicators.push(format!(
            "escape sequences make up {:.0}% of the source",
            escape_density * 100.0
        ));
    }

    let dynamic_access_ratio = if findings.member_accesses > 0 {
        findings.dynamic_accesses as f64 / findings.member_accesses as f64
    } else {
        0.0
    };
    if findings.dynamic_accesses >= 3 && dynamic_access_ratio > 0.5 {
        indicators.push(format!(
            "{} of {} member accesses use computed keys",
            findings.dynamic_accesses, findings.member_accesses
        ));
    }

    let longest_line = source.lines().map(|line| line.len()).max().unwrap_or(0);
    if longest_line > LONG_LINE {
        indicators.push(format!("longest line is {} characters", longest_line));
    }

    let confidence = (0.4 * minified_name_ratio
        + 0.3 * (escape_density * 5.0).min(1.0)
        + 0.2 * if findings.dynamic_accesses >= 3 { dynamic_access_ratio } else { 0.0 }
        + 0.1 * if longest_line > LONG_LINE { 1.0 } else { 0.0 })
    .clamp(0.0, 1.0);

    ObfuscationSignal {
        confidence,
        minified_name_ratio,
        escape_density,
        dynamic_access_ratio,
        longest_line,
        indicators,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::rules::{inspect, parser_engine};

    fn signal(source: &str) -> ObfuscationSignal {
        let ast = parser_engine().compile(source).unwrap();
        measure(source, &inspect(&ast, &[]))
    }

    #[test]
    fn test_readable_code_has_low_confidence() {
        let s = signal(
            r#"
            fn summarize(orders, currency) {
                let total = 0;
                for order in orders { total += order.amount; }
                #{ total: total, currency: currency }
            }
            "#,
        );
        assert!(s.confidence < 0.2, "{:?}", s);
        assert!(s.indicators.is_empty());
    }

    #[test]
    fn test_minified_and_escaped_code_scores_high() {
        let source = r#"fn a(b,c){let d=b[c];let e=d[c];let f=e[b];let g="\x65\x76\x61\x6c\x28\x29\x3b\x3b";f[g]}"#;
        let s = signal(source);
        assert!(s.minified_name_ratio > 0.5, "{:?}", s);
        assert!(s.escape_density > 0.1, "{:?}", s);
        assert!(s.confidence >= 0.6, "{:?}", s);
    }
}
