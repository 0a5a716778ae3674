//! Threat Rules
//!
//! AST 全体を走査して危険な呼び出し・アクセス・文字列パターンを検出し、
//! 同じ走査で複雑度と難読化判定用の数値を集める。

use regex::Regex;
use rhai::{ASTNode, Engine, Expr, OptimizationLevel, Stmt, AST};
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;
use tracing::warn;

use super::types::{CodeThreat, ComplexityMetrics, ThreatCategory};
use crate::types::Severity;

/// 解析用のパーサ（実行はしない）
///
/// 最適化を切ってソースの構造をそのまま残す。`eval` も構文として受け付ける。
pub fn parser_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.set_optimization_level(OptimizationLevel::None);
    engine
}

/// 名前で判定する呼び出しルール
struct CallRule {
    id: &'static str,
    names: &'static [&'static str],
    category: ThreatCategory,
    severity: Severity,
    description: &'static str,
}

const CALL_RULES: &[CallRule] = &[
    CallRule {
        id: "DYN-001",
        names: &["eval"],
        category: ThreatCategory::DynamicEvaluation,
        severity: Severity::Critical,
        description: "Dynamic code evaluation",
    },
    CallRule {
        id: "PROC-001",
        names: &[
            "exec", "spawn", "system", "shell", "command", "popen", "fork", "execve",
        ],
        category: ThreatCategory::ProcessSpawn,
        severity: Severity::Critical,
        description: "Process spawning attempt",
    },
    CallRule {
        id: "PROC-002",
        names: &["exit", "kill", "abort", "chdir", "setenv", "getenv"],
        category: ThreatCategory::GlobalAccess,
        severity: Severity::High,
        description: "Process control or environment access",
    },
    CallRule {
        id: "NET-001",
        names: &[
            "fetch",
            "http_get",
            "http_post",
            "http_request",
            "connect",
            "socket",
            "send_request",
            "open_url",
            "dns_lookup",
        ],
        category: ThreatCategory::NetworkAccess,
        severity: Severity::Medium,
        description: "Direct network access outside the mediated API",
    },
    CallRule {
        id: "FILE-001",
        names: &[
            "open",
            "read_file",
            "write_file",
            "remove_file",
            "delete_file",
            "read_dir",
            "readdir",
            "unlink",
            "chmod",
        ],
        category: ThreatCategory::FileAccess,
        severity: Severity::Medium,
        description: "Direct file access outside the mediated API",
    },
];

/// グローバル・プロセスオブジェクトを指す変数名
const GLOBAL_NAMES: &[&str] = &[
    "process",
    "global",
    "globalThis",
    "window",
    "require",
    "module",
    "__dirname",
    "__filename",
    "Deno",
];

/// プロトタイプ改ざんに使われるプロパティ名
const PROTOTYPE_PROPERTIES: &[&str] = &[
    "__proto__",
    "prototype",
    "constructor",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
];

/// 文字列リテラルに適用するパターン
pub struct StringRule {
    pub id: String,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub description: String,
    regex: Regex,
}

impl StringRule {
    pub fn new(
        id: &str,
        category: ThreatCategory,
        severity: Severity,
        pattern: &str,
        description: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.to_string(),
            category,
            severity,
            description: description.to_string(),
            regex: Regex::new(pattern)?,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

fn default_string_rules() -> Vec<StringRule> {
    let definitions = [
        (
            "INJ-001",
            ThreatCategory::Injection,
            Severity::High,
            r"(?i)\b(rm\s+-rf|chmod\s+[0-7]{3,4}|mkfifo|nc\s+-e)\b|(curl|wget)\s+[^|]*\|\s*(ba)?sh",
            "Shell command injection pattern",
        ),
        (
            "INJ-002",
            ThreatCategory::Injection,
            Severity::Medium,
            r"(?i)\bunion\s+(all\s+)?select\b|\bdrop\s+table\b|;\s*delete\s+from\b|'\s*or\s+'1'\s*=\s*'1",
            "SQL injection pattern",
        ),
        (
            "INJ-003",
            ThreatCategory::Injection,
            Severity::Medium,
            r"(?i)<script\b|javascript:|onerror\s*=",
            "Script injection pattern",
        ),
        (
            "FILE-002",
            ThreatCategory::FileAccess,
            Severity::High,
            r"\.\.[/\\]",
            "Path traversal sequence",
        ),
        (
            "FILE-003",
            ThreatCategory::FileAccess,
            Severity::High,
            r"(?i)^/(etc|proc|sys|root|dev|var/run)(/|$)|^[a-z]:\\windows\\|\.ssh/|id_rsa",
            "Sensitive host path",
        ),
        (
            "NET-002",
            ThreatCategory::NetworkAccess,
            Severity::Low,
            r"(?i)\b(https?|wss?|ftp)://",
            "Network URL literal",
        ),
        (
            "NET-003",
            ThreatCategory::NetworkAccess,
            Severity::Low,
            r"\b\d{1,3}(\.\d{1,3}){3}(:\d{2,5})?\b",
            "IP address literal",
        ),
    ];

    definitions
        .into_iter()
        .filter_map(|(id, category, severity, pattern, description)| {
            match StringRule::new(id, category, severity, pattern, description) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("Skipping string rule {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

/// 組み込みの文字列ルール
pub fn string_rules() -> &'static [StringRule] {
    static RULES: OnceLock<Vec<StringRule>> = OnceLock::new();
    RULES.get_or_init(default_string_rules)
}

/// 走査で集めた情報
#[derive(Debug, Default)]
pub struct Findings {
    pub threats: Vec<CodeThreat>,
    pub complexity: ComplexityMetrics,
    /// 参照された識別子（変数・関数・引数）
    pub identifiers: BTreeSet<String>,
    /// プロパティアクセスとインデックスアクセスの数
    pub member_accesses: u32,
    /// 定数でないキーによるインデックスアクセスの数
    pub dynamic_accesses: u32,
}

impl Findings {
    fn push(
        &mut self,
        id: &str,
        category: ThreatCategory,
        severity: Severity,
        description: impl Into<String>,
        node: &ASTNode,
        snippet: Option<&str>,
    ) {
        let position = node.position();
        let line = position.line();
        // 同じ行の同じルールは1件にまとめる
        if self
            .threats
            .iter()
            .any(|t| t.rule_id == id && t.line == line && t.snippet.as_deref() == snippet)
        {
            return;
        }
        self.threats.push(CodeThreat {
            rule_id: id.to_string(),
            category,
            severity,
            description: description.into(),
            line,
            column: position.position(),
            snippet: snippet.map(|s| s.chars().take(120).collect()),
        });
    }
}

fn is_control(stmt: &Stmt) -> bool {
    matches!(
        stmt,
        Stmt::If(..)
            | Stmt::Switch(..)
            | Stmt::While(..)
            | Stmt::Do(..)
            | Stmt::For(..)
            | Stmt::TryCatch(..)
    )
}

fn is_loop(stmt: &Stmt) -> bool {
    matches!(stmt, Stmt::While(..) | Stmt::Do(..) | Stmt::For(..))
}

fn stmt_key(stmt: &Stmt) -> usize {
    stmt as *const Stmt as usize
}

/// AST を走査して脅威とメトリクスを集める
pub fn inspect(ast: &AST, blocked_functions: &[String]) -> Findings {
    let mut findings = Findings::default();
    let mut unbounded_loops: Vec<(usize, Option<usize>, Option<usize>)> = Vec::new();
    let mut exited_loops: HashSet<usize> = HashSet::new();
    let mut decisions: u32 = 0;

    for function in ast.iter_functions() {
        findings.complexity.function_count += 1;
        findings.identifiers.insert(function.name.to_string());
        for param in &function.params {
            findings.identifiers.insert(param.to_string());
        }
    }

    ast.walk(&mut |path: &[ASTNode]| {
        let Some(node) = path.last() else {
            return true;
        };
        let ancestors = &path[..path.len() - 1];
        let nesting = ancestors
            .iter()
            .filter(|n| matches!(n, ASTNode::Stmt(s) if is_control(s)))
            .count() as u32;

        match node {
            ASTNode::Stmt(stmt) => {
                if !matches!(stmt, Stmt::Block(..) | Stmt::Noop(..)) {
                    findings.complexity.statements += 1;
                }

                if is_control(stmt) {
                    decisions += 1;
                    findings.complexity.cognitive += 1 + nesting;
                    findings.complexity.max_nesting =
                        findings.complexity.max_nesting.max(nesting + 1);
                }

                match stmt {
                    Stmt::FnCall(call, ..) => {
                        check_call(&mut findings, node, call.name.as_str(), &call.args, blocked_functions);
                    }
                    Stmt::Import(..) => findings.push(
                        "IMP-001",
                        ThreatCategory::ModuleImport,
                        Severity::High,
                        "Module import attempt",
                        node,
                        None,
                    ),
                    Stmt::BreakLoop(..) | Stmt::Return(..) => {
                        // 最も内側のループに脱出経路があると記録
                        if let Some(ASTNode::Stmt(owner)) = ancestors
                            .iter()
                            .rev()
                            .find(|n| matches!(n, ASTNode::Stmt(s) if is_loop(s)))
                        {
                            exited_loops.insert(stmt_key(owner));
                        }
                        if matches!(stmt, Stmt::Return(..)) {
                            // return は関数全体を抜けるので外側のループもすべて対象
                            for ancestor in ancestors {
                                if let ASTNode::Stmt(owner) = ancestor {
                                    if is_loop(owner) {
                                        exited_loops.insert(stmt_key(owner));
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            ASTNode::Expr(expr) => {
                // ループ直下の式は条件式
                if let Some(ASTNode::Stmt(parent @ (Stmt::While(..) | Stmt::Do(..)))) =
                    ancestors.last()
                {
                    if matches!(expr, Expr::Unit(..) | Expr::BoolConstant(true, ..)) {
                        let position = parent.position();
                        unbounded_loops.push((stmt_key(parent), position.line(), position.position()));
                    }
                }

                match expr {
                    Expr::FnCall(call, ..) | Expr::MethodCall(call, ..) => {
                        check_call(&mut findings, node, call.name.as_str(), &call.args, blocked_functions);
                    }
                    Expr::And(..) | Expr::Or(..) | Expr::Coalesce(..) => {
                        decisions += 1;
                        findings.complexity.cognitive += 1;
                    }
                    Expr::Variable(var, ..) => {
                        let name = var.1.as_str();
                        findings.identifiers.insert(name.to_string());
                        if GLOBAL_NAMES.contains(&name) {
                            findings.push(
                                "GLOB-001",
                                ThreatCategory::GlobalAccess,
                                Severity::High,
                                format!("Access to host global '{}'", name),
                                node,
                                Some(name),
                            );
                        }
                    }
                    Expr::Property(property, ..) => {
                        findings.member_accesses += 1;
                        let name = property.2.as_str();
                        if PROTOTYPE_PROPERTIES.contains(&name) {
                            findings.push(
                                "PROTO-001",
                                ThreatCategory::PrototypeTampering,
                                Severity::High,
                                format!("Prototype property '{}' accessed", name),
                                node,
                                Some(name),
                            );
                        }
                    }
                    Expr::Index(index, ..) => {
                        findings.member_accesses += 1;
                        if !index.rhs.is_constant() {
                            findings.dynamic_accesses += 1;
                        } else if let Expr::StringConstant(key, ..) = &index.rhs {
                            if PROTOTYPE_PROPERTIES.contains(&key.as_str()) {
                                findings.push(
                                    "PROTO-001",
                                    ThreatCategory::PrototypeTampering,
                                    Severity::High,
                                    format!("Prototype property '{}' accessed", key),
                                    node,
                                    Some(key.as_str()),
                                );
                            }
                        }
                    }
                    Expr::StringConstant(text, ..) => {
                        for rule in string_rules() {
                            if rule.is_match(text.as_str()) {
                                findings.push(
                                    &rule.id,
                                    rule.category,
                                    rule.severity,
                                    rule.description.clone(),
                                    node,
                                    Some(text.as_str()),
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        true
    });

    for (key, line, column) in unbounded_loops {
        if !exited_loops.contains(&key) {
            findings.threats.push(CodeThreat {
                rule_id: "LOOP-001".to_string(),
                category: ThreatCategory::ResourceAbuse,
                severity: Severity::Medium,
                description: "Unconditional loop without break or return".to_string(),
                line,
                column,
                snippet: None,
            });
        }
    }

    findings.complexity.cyclomatic = 1 + decisions;
    findings
}

fn check_call(
    findings: &mut Findings,
    node: &ASTNode,
    name: &str,
    args: &[Expr],
    blocked_functions: &[String],
) {
    for rule in CALL_RULES {
        if rule.names.contains(&name) {
            findings.push(
                rule.id,
                rule.category,
                rule.severity,
                format!("{}: {}()", rule.description, name),
                node,
                Some(name),
            );
            return;
        }
    }

    // 文字列から関数ポインタを作る Fn(expr) は動的ディスパッチ
    if name == "Fn" && args.first().is_some_and(|arg| !arg.is_constant()) {
        findings.push(
            "DYN-002",
            ThreatCategory::DynamicEvaluation,
            Severity::High,
            "Function pointer built from a runtime string",
            node,
            Some(name),
        );
        return;
    }

    if blocked_functions.iter().any(|blocked| blocked == name) {
        findings.push(
            "BLOCK-001",
            ThreatCategory::DynamicEvaluation,
            Severity::Critical,
            format!("Call to blocked function {}()", name),
            node,
            Some(name),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings(source: &str) -> Findings {
        let engine = parser_engine();
        let ast = engine.compile(source).unwrap();
        inspect(&ast, &[])
    }

    fn rule_ids(findings: &Findings) -> Vec<&str> {
        findings.threats.iter().map(|t| t.rule_id.as_str()).collect()
    }

    #[test]
    fn test_detects_eval_inside_function() {
        let f = findings(r#"fn run() { eval("1 + 1") }"#);
        assert!(rule_ids(&f).contains(&"DYN-001"));
        assert_eq!(f.threats[0].severity, Severity::Critical);
        assert_eq!(f.threats[0].line, Some(1));
    }

    #[test]
    fn test_detects_dynamic_function_pointer() {
        let f = findings(r#"fn run(name) { let f = Fn(name); f.call() }"#);
        assert!(rule_ids(&f).contains(&"DYN-002"));

        // リテラルからの関数ポインタは対象外
        let f = findings(r#"fn helper() { 1 } fn run() { let f = Fn("helper"); f.call() }"#);
        assert!(!rule_ids(&f).contains(&"DYN-002"));
    }

    #[test]
    fn test_detects_string_patterns() {
        let f = findings(r#"let p = "../../etc/passwd"; let u = "https://evil.example";"#);
        let ids = rule_ids(&f);
        assert!(ids.contains(&"FILE-002"));
        assert!(ids.contains(&"NET-002"));
    }

    #[test]
    fn test_detects_prototype_and_globals() {
        let f = findings(r#"fn run(o) { o.__proto__ = 1; process }"#);
        let ids = rule_ids(&f);
        assert!(ids.contains(&"PROTO-001"));
        assert!(ids.contains(&"GLOB-001"));
    }

    #[test]
    fn test_unbounded_loop_without_exit() {
        let f = findings("fn spin() { loop { let x = 1; } }");
        assert!(rule_ids(&f).contains(&"LOOP-001"));

        let f = findings("fn spin() { let n = 0; loop { n += 1; if n > 10 { break; } } }");
        assert!(!rule_ids(&f).contains(&"LOOP-001"));
    }

    #[test]
    fn test_complexity_metrics() {
        let f = findings(
            r#"
            fn classify(x) {
                if x > 10 {
                    if x > 100 { return "huge"; }
                    "big"
                } else if x > 0 && x < 5 {
                    "small"
                } else {
                    "other"
                }
            }
            "#,
        );
        assert_eq!(f.complexity.function_count, 1);
        assert!(f.complexity.cyclomatic >= 4);
        assert!(f.complexity.max_nesting >= 2);
        assert!(f.complexity.cognitive > f.complexity.cyclomatic - 1);
    }

    #[test]
    fn test_clean_code_has_no_threats() {
        let f = findings(
            r#"
            fn run(items) {
                let total = 0;
                for item in items { total += item; }
                storage_set("total", total);
                total
            }
            "#,
        );
        assert!(f.threats.is_empty(), "{:?}", f.threats);
    }
}
