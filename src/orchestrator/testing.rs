//! Security Test Battery
//!
//! 実行前にプラグインに対して行う固定のチェック群。

use std::collections::HashMap;

use super::types::{SecurityTestReport, SecurityTestResult};
use crate::analyzer::{CodeAnalysisResult, ThreatCategory};
use crate::permission::{scope_matches, PatternCache, Permission, SecurityContext};
use crate::plugin::Plugin;
use crate::sandbox::DryRunReport;

/// 仲介APIとして提供している機能
pub const MEDIATED_CAPABILITIES: &[&str] = &["log", "storage", "fs"];

/// 仲介APIの外側に手を伸ばすコードの兆候
const UNMEDIATED_CATEGORIES: &[ThreatCategory] = &[
    ThreatCategory::ProcessSpawn,
    ThreatCategory::NetworkAccess,
    ThreatCategory::ModuleImport,
    ThreatCategory::GlobalAccess,
];

/// テスト1件の定義
struct TestCase {
    name: &'static str,
    weight: f64,
}

const MANIFEST_INTEGRITY: TestCase = TestCase {
    name: "manifest-integrity",
    weight: 2.0,
};
const ENTRY_POINTS_DEFINED: TestCase = TestCase {
    name: "entry-points-defined",
    weight: 2.0,
};
const PERMISSION_SCOPE: TestCase = TestCase {
    name: "permission-scope",
    weight: 2.0,
};
const CAPABILITY_SURFACE: TestCase = TestCase {
    name: "capability-surface",
    weight: 3.0,
};
const SANDBOX_DRY_RUN: TestCase = TestCase {
    name: "sandbox-dry-run",
    weight: 3.0,
};

impl TestCase {
    fn result(&self, outcome: Result<String, String>) -> SecurityTestResult {
        let (passed, message) = match outcome {
            Ok(message) => (true, message),
            Err(message) => (false, message),
        };
        SecurityTestResult {
            name: self.name.to_string(),
            passed,
            weight: self.weight,
            message,
        }
    }
}

/// セキュリティテストスイート
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityTestSuite;

impl SecurityTestSuite {
    pub fn new() -> Self {
        Self
    }

    /// 全テストを実行
    pub fn run(
        &self,
        plugin: &Plugin,
        analysis: &CodeAnalysisResult,
        context: &SecurityContext,
        dry_run: &DryRunReport,
    ) -> SecurityTestReport {
        SecurityTestReport::from_results(vec![
            MANIFEST_INTEGRITY.result(manifest_integrity(plugin)),
            ENTRY_POINTS_DEFINED.result(entry_points_defined(plugin, dry_run)),
            PERMISSION_SCOPE.result(permission_scope(plugin, context)),
            CAPABILITY_SURFACE.result(capability_surface(plugin, analysis)),
            SANDBOX_DRY_RUN.result(sandbox_dry_run(dry_run)),
        ])
    }
}

fn manifest_integrity(plugin: &Plugin) -> Result<String, String> {
    plugin
        .manifest()
        .validate()
        .map_err(|e| e.to_string())?;
    if plugin.source().trim().is_empty() {
        return Err(format!("{} is empty", plugin.manifest().main_file()));
    }
    Ok(format!("fingerprint {}", plugin.fingerprint()))
}

fn entry_points_defined(plugin: &Plugin, dry_run: &DryRunReport) -> Result<String, String> {
    let declared = &plugin.manifest().entry_points;
    if declared.is_empty() {
        return Err("no entry points declared".to_string());
    }
    if !dry_run.compiled {
        return Err("entry points cannot be resolved without a compiled script".to_string());
    }
    if !dry_run.missing_entry_points.is_empty() {
        return Err(format!(
            "declared but not defined: {}",
            dry_run.missing_entry_points.join(", ")
        ));
    }
    Ok(format!("{} entry points defined", declared.len()))
}

/// 宣言された権限が信頼レベルで得られる範囲に収まっているか
fn permission_scope(plugin: &Plugin, context: &SecurityContext) -> Result<String, String> {
    let now = chrono::Utc::now();
    let empty = HashMap::new();
    let patterns = PatternCache::default();
    let uncovered: Vec<String> = plugin
        .manifest()
        .permissions
        .iter()
        .filter(|declared| {
            let applicable = |p: &&Permission| {
                !p.is_expired(now)
                    && p.covers_type(&declared.permission)
                    && scope_matches(&p.scope, declared.resource.as_deref(), &empty, &patterns)
            };
            let denied = context.permissions().filter(applicable).any(|p| !p.granted);
            denied || !context.permissions().filter(applicable).any(|p| p.granted)
        })
        .map(|declared| match &declared.resource {
            Some(resource) => format!("{} on {}", declared.permission, resource),
            None => declared.permission.clone(),
        })
        .collect();

    if uncovered.is_empty() {
        Ok(format!(
            "{} declared permissions within trust level {}",
            plugin.manifest().permissions.len(),
            context.trust_level
        ))
    } else {
        Err(format!(
            "not granted at trust level {}: {}",
            context.trust_level,
            uncovered.join(", ")
        ))
    }
}

fn capability_surface(plugin: &Plugin, analysis: &CodeAnalysisResult) -> Result<String, String> {
    let unknown: Vec<&str> = plugin
        .manifest()
        .capabilities
        .iter()
        .map(String::as_str)
        .filter(|c| !MEDIATED_CAPABILITIES.contains(c))
        .collect();
    if !unknown.is_empty() {
        return Err(format!("unmediated capabilities requested: {}", unknown.join(", ")));
    }

    let reaching: Vec<&str> = analysis
        .threats
        .iter()
        .filter(|t| UNMEDIATED_CATEGORIES.contains(&t.category))
        .map(|t| t.rule_id.as_str())
        .collect();
    if !reaching.is_empty() {
        return Err(format!(
            "code reaches outside the mediated surface: {}",
            reaching.join(", ")
        ));
    }
    Ok("only mediated capabilities used".to_string())
}

fn sandbox_dry_run(dry_run: &DryRunReport) -> Result<String, String> {
    match (&dry_run.compiled, &dry_run.error) {
        (true, _) => Ok(format!(
            "compiled with {} functions",
            dry_run.functions.len()
        )),
        (false, Some(error)) => Err(format!("compilation failed: {}", error)),
        (false, None) => Err("compilation failed".to_string()),
    }
}
