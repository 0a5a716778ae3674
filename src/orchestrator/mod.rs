//! Security Orchestrator
//!
//! 静的解析・署名検証・権限・セキュリティテストを束ねて1つの評価にまとめ、
//! 監視付きでプラグインを実行する。

pub mod router;
pub mod testing;
pub mod types;

pub use router::{spawn_pump, EventRouter};
pub use testing::{SecurityTestSuite, MEDIATED_CAPABILITIES};
pub use types::{
    ComponentScores, ExecutionBlocker, RecentThreat, RiskLevel, SecurityAssessment,
    SecurityPosture, SecurityTestReport, SecurityTestResult,
};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::analyzer::{CodeAnalysisResult, CodeAnalyzer};
use crate::behavior::{BehaviorMonitor, ThreatAssessment};
use crate::config::{OrchestratorConfig, SentinelConfig};
use crate::emergency::{
    EmergencyController, EmergencyRequest, EmergencyTrigger, ForensicSource, ThreatResponder,
};
use crate::error::Result;
use crate::events::{EventBus, EventSink, HostNotification};
use crate::permission::PermissionManager;
use crate::plugin::Plugin;
use crate::resource::{ResourceLimits, ResourceMonitor, SysinfoSampler, SystemSampler};
use crate::sandbox::{
    CapabilityBroker, ExecutionController, ExecutionError, ExecutionErrorKind, ExecutionResult,
    SandboxExecutor, TerminationReason,
};
use crate::signature::{PluginSignature, RevocationEntry, SignatureVerifier, VerificationResult};
use crate::types::{ExecutionId, Severity, ThreatLevel, TrustLevel};

/// 終端状態の記録を保持する時間
const FINISHED_RETENTION: Duration = Duration::from_secs(3600);

/// 姿勢レポートに含める直近の脅威評価の件数
const RECENT_THREATS: usize = 20;

/// 評価の保管（件数上限つき、古いものから捨てる）
struct AssessmentStore {
    capacity: usize,
    by_id: HashMap<Uuid, SecurityAssessment>,
    latest: HashMap<String, Uuid>,
    order: VecDeque<Uuid>,
}

impl AssessmentStore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            by_id: HashMap::new(),
            latest: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, assessment: SecurityAssessment) {
        self.latest
            .insert(assessment.plugin_id.clone(), assessment.id);
        self.order.push_back(assessment.id);
        self.by_id.insert(assessment.id, assessment);

        while self.order.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(removed) = self.by_id.remove(&oldest) {
                if self.latest.get(&removed.plugin_id) == Some(&oldest) {
                    self.latest.remove(&removed.plugin_id);
                }
            }
        }
    }

    fn latest(&self, plugin_id: &str) -> Option<&SecurityAssessment> {
        self.latest.get(plugin_id).and_then(|id| self.by_id.get(id))
    }

    /// 指定の鍵で署名された評価を破棄し、対象のプラグインを返す
    fn remove_signed_by(&mut self, key_id: &str) -> Vec<String> {
        let removed: Vec<Uuid> = self
            .by_id
            .values()
            .filter(|a| a.signature.key_id.as_deref() == Some(key_id))
            .map(|a| a.id)
            .collect();
        let mut plugins = Vec::new();
        for id in &removed {
            if let Some(assessment) = self.by_id.remove(id) {
                if self.latest.get(&assessment.plugin_id) == Some(id) {
                    self.latest.remove(&assessment.plugin_id);
                }
                if !plugins.contains(&assessment.plugin_id) {
                    plugins.push(assessment.plugin_id);
                }
            }
        }
        self.order.retain(|id| !removed.contains(id));
        plugins
    }
}

/// セキュリティオーケストレーター
///
/// 各コンポーネントはここで一度だけ構築され、必要な相手に参照を渡す。
/// 能力呼び出しやリソース違反のイベントは [`EventRouter`] を通って
/// ホスト向けバスと振る舞い監視の両方に届く。
pub struct SecurityOrchestrator {
    config: OrchestratorConfig,
    require_signature: bool,
    default_limits: ResourceLimits,
    bus: Arc<EventBus>,
    analyzer: CodeAnalyzer,
    verifier: SignatureVerifier,
    permissions: Arc<PermissionManager>,
    executor: Arc<SandboxExecutor>,
    resources: ResourceMonitor,
    behavior: BehaviorMonitor,
    emergency: Arc<EmergencyController>,
    suite: SecurityTestSuite,
    assessments: RwLock<AssessmentStore>,
    // 緊急対応側は弱参照しか持たないので、ここで生かしておく
    _forensic_sources: Vec<Arc<dyn ForensicSource>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecurityOrchestrator {
    /// 設定からすべてのコンポーネントを構築する
    pub async fn new(config: SentinelConfig) -> Result<Self> {
        Self::with_system_sampler(config, Arc::new(SysinfoSampler::new())).await
    }

    /// システムサンプラーを差し替えて構築する
    pub async fn with_system_sampler(
        config: SentinelConfig,
        system_sampler: Arc<dyn SystemSampler>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.orchestrator.event_bus_capacity));
        let (router, receiver) = EventRouter::new(bus.clone());
        let router: Arc<dyn EventSink> = Arc::new(router);

        let permissions = Arc::new(PermissionManager::new(
            config.permission.clone(),
            router.clone(),
        ));
        let broker = Arc::new(CapabilityBroker::new(
            config.sandbox.clone(),
            permissions.clone(),
            router.clone(),
        ));
        let executor = Arc::new(SandboxExecutor::new(
            config.sandbox.clone(),
            broker,
            router.clone(),
        ));
        let resources = ResourceMonitor::new(
            config.resource.clone(),
            executor.clone(),
            system_sampler,
            executor.clone(),
            router.clone(),
        );
        let behavior = BehaviorMonitor::new(config.behavior.clone(), bus.clone());
        let emergency = Arc::new(
            EmergencyController::open(config.emergency.clone(), executor.clone(), bus.clone())
                .await?,
        );

        resources.set_responder(emergency.clone()).await;
        behavior.set_responder(emergency.clone()).await;
        let forensic_sources: Vec<Arc<dyn ForensicSource>> =
            vec![Arc::new(resources.clone()), Arc::new(behavior.clone())];
        for source in &forensic_sources {
            emergency.register_forensic_source(source).await;
        }

        let verifier = SignatureVerifier::open(config.signature.clone()).await?;
        let analyzer = CodeAnalyzer::new(config.analyzer.clone());

        let token = CancellationToken::new();
        let pump = spawn_pump(receiver, behavior.clone(), token.clone());

        info!(
            strict_mode = config.orchestrator.strict_mode,
            require_signature = config.signature.require_signature,
            "Security orchestrator initialized"
        );

        Ok(Self {
            require_signature: config.signature.require_signature,
            default_limits: config.resource.default_limits.clone(),
            assessments: RwLock::new(AssessmentStore::new(config.orchestrator.max_assessments)),
            config: config.orchestrator,
            bus,
            analyzer,
            verifier,
            permissions,
            executor,
            resources,
            behavior,
            emergency,
            suite: SecurityTestSuite::new(),
            _forensic_sources: forensic_sources,
            token,
            tasks: Mutex::new(vec![pump]),
        })
    }

    /// 定期処理を開始する（振る舞いの評価、保持期間の整理）
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.behavior.spawn_sweeper(self.token.child_token()));
        tasks.push(self.spawn_cleanup());
        info!("Security orchestrator started");
    }

    fn spawn_cleanup(&self) -> JoinHandle<()> {
        let token = self.token.child_token();
        let emergency = self.emergency.clone();
        let resources = self.resources.clone();
        let interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = emergency.apply_retention().await {
                            warn!("Incident retention failed: {}", e);
                        }
                        let states = emergency.prune_states(FINISHED_RETENTION).await;
                        let records = resources.prune_finished(FINISHED_RETENTION).await;
                        debug!(states, records, "Cleanup sweep");
                    }
                }
            }
        })
    }

    /// 定期処理を止め、実行中のプラグインをすべて終了させる
    pub async fn shutdown(&self) {
        self.token.cancel();

        let active = self.executor.active_executions().await;
        let terminated = join_all(active.iter().map(|execution| {
            self.executor
                .terminate(execution.execution_id, TerminationReason::Shutdown)
        }))
        .await
        .into_iter()
        .filter(|stopped| *stopped)
        .count();
        self.resources.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for outcome in join_all(tasks).await {
            if let Err(e) = outcome {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!(terminated, "Security orchestrator shut down");
    }

    /// ホスト向けの通知を購読する
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HostNotification> {
        self.bus.subscribe()
    }

    /// プラグインを評価する
    ///
    /// 静的解析と署名検証を並行して行い、信頼レベルから権限コンテキストを作り直す。
    #[instrument(skip_all, fields(plugin = %plugin.id()))]
    pub async fn assess_plugin(
        &self,
        plugin: &Plugin,
        signature: Option<&PluginSignature>,
    ) -> SecurityAssessment {
        let plugin_id = plugin.id();
        let (analysis, verification) = tokio::join!(
            self.analyzer.analyze(plugin.source()),
            self.verifier.verify(plugin, signature)
        );

        let trust_level = if verification.valid {
            verification.trust_level
        } else {
            TrustLevel::Untrusted
        };
        let context = self
            .permissions
            .create_context(&plugin_id, plugin.name(), trust_level)
            .await;

        let tests = if self.config.run_security_tests {
            let dry_run = self.executor.dry_run(plugin, context.sandbox_level);
            Some(self.suite.run(plugin, &analysis, &context, &dry_run))
        } else {
            None
        };

        let behavior = self.behavior.latest_for_plugin(&plugin_id).await;
        let scores = ComponentScores {
            analysis: Some(analysis.score),
            signature: Some(signature_score(&verification)),
            testing: tests.as_ref().map(|t| t.score),
            behavior: behavior
                .as_ref()
                .map(|b| (100.0 - b.risk_score).clamp(0.0, 100.0)),
        };
        let overall_score = weighted_score(&self.config, &scores);
        let risk_level = RiskLevel::from_score(overall_score);

        let quarantined = self.emergency.is_quarantined(&plugin_id).await;
        let blockers = self.blockers(quarantined, risk_level, &analysis, &verification);
        let execution_allowed = blockers.is_empty()
            && (risk_level != RiskLevel::Critical || self.config.emergency_override);
        let recommendations = recommendations(
            &analysis,
            &verification,
            tests.as_ref(),
            behavior.as_ref(),
            &blockers,
        );

        let assessment = SecurityAssessment {
            id: Uuid::new_v4(),
            plugin_id,
            fingerprint: plugin.fingerprint(),
            created_at: Utc::now(),
            analysis: (*analysis).clone(),
            signature: verification,
            trust_level,
            sandbox_level: context.sandbox_level,
            tests,
            behavior,
            scores,
            overall_score,
            risk_level,
            blockers,
            execution_allowed,
            recommendations,
        };

        if assessment.execution_allowed {
            info!(
                score = assessment.overall_score,
                risk = %assessment.risk_level,
                trust_level = %assessment.trust_level,
                "Plugin assessed"
            );
        } else {
            warn!(
                score = assessment.overall_score,
                risk = %assessment.risk_level,
                blockers = ?assessment.blockers,
                "Plugin assessed; execution blocked"
            );
        }
        self.assessments.write().await.insert(assessment.clone());
        assessment
    }

    fn blockers(
        &self,
        quarantined: bool,
        risk_level: RiskLevel,
        analysis: &CodeAnalysisResult,
        verification: &VerificationResult,
    ) -> Vec<ExecutionBlocker> {
        let mut blockers = Vec::new();
        if quarantined {
            blockers.push(ExecutionBlocker::Quarantined);
        }
        if self.config.strict_mode && risk_level == RiskLevel::Critical {
            blockers.push(ExecutionBlocker::CriticalRisk);
        }
        if analysis.threat_level == ThreatLevel::Critical {
            blockers.push(ExecutionBlocker::CriticalCodeThreat);
        }
        if self.require_signature && !verification.valid {
            blockers.push(ExecutionBlocker::InvalidSignature);
        }
        blockers
    }

    /// 監視付きでプラグインを実行する
    ///
    /// 同じ内容の評価がなければ先に（署名なしで）評価する。拒否した場合も
    /// 常に `success=false` の結果を返す。
    #[instrument(skip(self, plugin, args), fields(plugin = %plugin.id()))]
    pub async fn execute_plugin(
        &self,
        plugin: &Plugin,
        entry_point: &str,
        args: Vec<Value>,
    ) -> ExecutionResult {
        let plugin_id = plugin.id();
        let execution_id = Uuid::new_v4();

        if let Some(record) = self.emergency.quarantine_record(&plugin_id).await {
            warn!("Refusing to run quarantined plugin");
            return ExecutionResult::refused(
                execution_id,
                plugin_id,
                entry_point,
                ExecutionError::new(
                    ExecutionErrorKind::Quarantined,
                    format!("plugin is quarantined: {}", record.reason),
                ),
            );
        }

        let fingerprint = plugin.fingerprint();
        let mut reusable = self
            .assessments
            .read()
            .await
            .latest(&plugin_id)
            .filter(|a| a.fingerprint == fingerprint)
            .cloned();
        // 評価後に署名鍵が失効していれば評価し直す
        if let Some(key_id) = reusable.as_ref().and_then(|a| a.signature.key_id.clone()) {
            if self.verifier.is_revoked(&key_id).await {
                warn!(key_id = %key_id, "Signing key revoked since assessment, reassessing");
                reusable = None;
            }
        }
        let assessment = match reusable {
            Some(assessment) => assessment,
            None => self.assess_plugin(plugin, None).await,
        };
        if !assessment.execution_allowed {
            let reason = if assessment.blockers.is_empty() {
                format!("risk level {}", assessment.risk_level)
            } else {
                assessment
                    .blockers
                    .iter()
                    .map(ExecutionBlocker::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            return ExecutionResult::refused(
                execution_id,
                plugin_id,
                entry_point,
                ExecutionError::new(
                    ExecutionErrorKind::Blocked,
                    format!("execution blocked by assessment {}: {}", assessment.id, reason),
                ),
            );
        }

        let limits = self.executor.limits_for(assessment.sandbox_level);
        let resource_limits = ResourceLimits {
            max_heap_bytes: limits.max_memory_bytes,
            max_execution_time_ms: limits.max_execution_time_ms,
            hard_timeout_ms: self
                .default_limits
                .hard_timeout_ms
                .max(limits.max_execution_time_ms.saturating_mul(2)),
            ..self.default_limits.clone()
        };

        self.emergency
            .register_execution(execution_id, &plugin_id)
            .await;
        self.behavior
            .start_monitoring(execution_id, &plugin_id)
            .await;
        if let Err(e) = self
            .resources
            .start_monitoring(execution_id, plugin_id.clone(), Some(resource_limits))
            .await
        {
            error!("Resource monitoring could not start: {}", e);
            self.behavior.stop_monitoring(execution_id).await;
            self.emergency.complete_execution(execution_id).await;
            return ExecutionResult::refused(
                execution_id,
                plugin_id,
                entry_point,
                ExecutionError::new(
                    ExecutionErrorKind::Internal,
                    format!("resource monitoring unavailable: {}", e),
                ),
            );
        }

        let result = self
            .executor
            .run_with_id(execution_id, plugin, entry_point, args, limits)
            .await;

        self.resources.stop_monitoring(execution_id).await;
        let final_assessment = self.behavior.stop_monitoring(execution_id).await;
        self.settle(&result, final_assessment).await;
        result
    }

    /// 実行後のインシデント判定
    async fn settle(&self, result: &ExecutionResult, behavior: Option<ThreatAssessment>) {
        let execution_id = result.execution_id;
        let trigger = match result.error_kind() {
            Some(kind) if kind.is_runaway() => Some((
                EmergencyTrigger::InfiniteLoop,
                Severity::High,
                result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| kind.to_string()),
            )),
            Some(kind @ (ExecutionErrorKind::MemoryLimit | ExecutionErrorKind::ResourceLimit)) => {
                Some((
                    EmergencyTrigger::ResourceExhaustion,
                    Severity::High,
                    result
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| kind.to_string()),
                ))
            }
            _ => behavior
                .filter(|a| a.threat_level == ThreatLevel::Critical)
                .map(|a| {
                    (
                        EmergencyTrigger::SuspiciousBehavior,
                        Severity::Critical,
                        format!("critical behavior assessment (risk {:.0})", a.risk_score),
                    )
                }),
        };

        match trigger {
            Some((trigger, severity, description)) => {
                let response = self
                    .emergency
                    .trigger_emergency(EmergencyRequest {
                        execution_id,
                        plugin_id: result.plugin_id.clone(),
                        trigger,
                        severity,
                        description,
                    })
                    .await;
                if !response.success {
                    // 実行中に別の経路で対応済み
                    debug!(%execution_id, "{}", response.message);
                }
            }
            None => {
                self.emergency.complete_execution(execution_id).await;
            }
        }
    }

    /// 署名鍵を失効させる
    ///
    /// その鍵で署名された評価を破棄し、対象プラグインのコンテキストを untrusted に落とす。
    #[instrument(skip(self, reason))]
    pub async fn revoke_key(&self, key_id: &str, reason: &str) -> Result<RevocationEntry> {
        let entry = self.verifier.revoke_key(key_id, reason).await?;
        let affected = self.assessments.write().await.remove_signed_by(key_id);
        for plugin_id in &affected {
            let name = plugin_id
                .split_once('@')
                .map_or(plugin_id.as_str(), |(name, _)| name);
            self.permissions
                .create_context(plugin_id, name, TrustLevel::Untrusted)
                .await;
        }
        warn!(
            affected = affected.len(),
            "Dropped assessments signed by revoked key {}", key_id
        );
        Ok(entry)
    }

    /// プラグインの直近の評価
    pub async fn latest_assessment(&self, plugin_id: &str) -> Option<SecurityAssessment> {
        self.assessments.read().await.latest(plugin_id).cloned()
    }

    pub async fn assessment(&self, assessment_id: Uuid) -> Option<SecurityAssessment> {
        self.assessments.read().await.by_id.get(&assessment_id).cloned()
    }

    /// ホスト全体のセキュリティ状況
    pub async fn security_posture(&self) -> SecurityPosture {
        let recent_threats = self
            .behavior
            .recent_assessments(RECENT_THREATS)
            .await
            .into_iter()
            .map(|a| RecentThreat {
                plugin_id: a.plugin_id,
                execution_id: a.execution_id,
                threat_level: a.threat_level,
                risk_score: a.risk_score,
                assessed_at: a.assessed_at,
            })
            .collect();

        SecurityPosture {
            generated_at: Utc::now(),
            active_executions: self.executor.active_count().await,
            monitored_executions: self.resources.monitored_count().await,
            quarantined: self.emergency.list_quarantined().await,
            incident_count: self.emergency.incident_count().await,
            assessments: self.assessments.read().await.by_id.len(),
            recent_threats,
            audit: self.permissions.audit_statistics().await,
        }
    }

    /// 手動でインシデントを起こす
    pub async fn trigger_emergency(
        &self,
        execution_id: ExecutionId,
        plugin_id: &str,
        description: &str,
    ) -> crate::emergency::EmergencyResponse {
        self.emergency
            .trigger_emergency(EmergencyRequest {
                execution_id,
                plugin_id: plugin_id.to_string(),
                trigger: EmergencyTrigger::Manual,
                severity: Severity::Critical,
                description: description.to_string(),
            })
            .await
    }

    pub fn analyzer(&self) -> &CodeAnalyzer {
        &self.analyzer
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    pub fn resources(&self) -> &ResourceMonitor {
        &self.resources
    }

    pub fn behavior(&self) -> &BehaviorMonitor {
        &self.behavior
    }

    pub fn emergency(&self) -> &Arc<EmergencyController> {
        &self.emergency
    }
}

/// 署名検証のスコア
fn signature_score(verification: &VerificationResult) -> f64 {
    if !verification.valid {
        return 0.0;
    }
    match verification.trust_level {
        TrustLevel::System => 100.0,
        TrustLevel::Trusted => 90.0,
        TrustLevel::Verified => 75.0,
        TrustLevel::Basic => 50.0,
        TrustLevel::Untrusted => 25.0,
    }
}

/// 実行した構成要素だけで重みを正規化した加重平均
fn weighted_score(config: &OrchestratorConfig, scores: &ComponentScores) -> f64 {
    let parts = [
        (scores.analysis, config.analysis_weight),
        (scores.signature, config.signature_weight),
        (scores.testing, config.testing_weight),
        (scores.behavior, config.behavior_weight),
    ];
    let (total, weight) = parts
        .iter()
        .filter_map(|(score, weight)| score.map(|s| (s * weight, *weight)))
        .fold((0.0, 0.0), |(total, sum), (s, w)| (total + s, sum + w));
    if weight > 0.0 {
        (total / weight).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn recommendations(
    analysis: &CodeAnalysisResult,
    verification: &VerificationResult,
    tests: Option<&SecurityTestReport>,
    behavior: Option<&ThreatAssessment>,
    blockers: &[ExecutionBlocker],
) -> Vec<String> {
    let mut out = Vec::new();
    for blocker in blockers {
        out.push(match blocker {
            ExecutionBlocker::Quarantined => {
                "Release the quarantine only after reviewing the recorded incident".to_string()
            }
            ExecutionBlocker::CriticalRisk => {
                "Overall risk is critical; address the findings below before running".to_string()
            }
            ExecutionBlocker::CriticalCodeThreat => {
                "Remove the critical constructs reported by static analysis".to_string()
            }
            ExecutionBlocker::InvalidSignature => {
                "Sign the plugin with a key registered in the trust store".to_string()
            }
        });
    }
    for threat in analysis.threats.iter().filter(|t| t.severity >= Severity::High) {
        out.push(match threat.line {
            Some(line) => format!("{} at line {}: {}", threat.rule_id, line, threat.description),
            None => format!("{}: {}", threat.rule_id, threat.description),
        });
    }
    out.extend(verification.warnings.iter().cloned());
    if let Some(tests) = tests {
        out.extend(
            tests
                .failed()
                .map(|r| format!("Security test {} failed: {}", r.name, r.message)),
        );
    }
    if let Some(behavior) = behavior.filter(|b| b.threat_level >= ThreatLevel::Medium) {
        out.push(format!(
            "Previous execution was assessed {} ({})",
            behavior.threat_level,
            behavior.indicators.join("; ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginManifest;
    use crate::resource::{StaticSystemSampler, SystemSnapshot};

    fn plugin(name: &str, source: &str) -> Plugin {
        let manifest = PluginManifest::from_json(&format!(
            r#"{{"name":"{}","version":"1.0.0","description":"test plugin",
                "capabilities":["log","storage"],"entryPoints":["run"]}}"#,
            name
        ))
        .unwrap();
        Plugin::new(manifest, source).unwrap()
    }

    /// 署名なしのプラグインを許す設定
    fn unsigned_allowed() -> SentinelConfig {
        let mut config = SentinelConfig::default();
        config.signature.require_signature = false;
        config
    }

    async fn orchestrator(config: SentinelConfig) -> SecurityOrchestrator {
        SecurityOrchestrator::with_system_sampler(
            config,
            Arc::new(StaticSystemSampler(SystemSnapshot::default())),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_weighted_score_renormalizes() {
        let config = OrchestratorConfig::default();
        let scores = ComponentScores {
            analysis: Some(100.0),
            signature: Some(0.0),
            testing: None,
            behavior: None,
        };
        // 0.30 / 0.55
        let expected = 100.0 * 0.30 / 0.55;
        assert!((weighted_score(&config, &scores) - expected).abs() < 1e-9);
        assert_eq!(weighted_score(&config, &ComponentScores::default()), 0.0);
    }

    #[tokio::test]
    async fn test_assessment_store_evicts_oldest() {
        let mut config = unsigned_allowed();
        config.orchestrator.max_assessments = 1;
        let orchestrator = orchestrator(config).await;
        let first = orchestrator
            .assess_plugin(&plugin("first", "fn run() { 1 }"), None)
            .await;
        let second = orchestrator
            .assess_plugin(&plugin("second", "fn run() { 2 }"), None)
            .await;

        assert!(orchestrator.assessment(first.id).await.is_none());
        assert!(orchestrator.latest_assessment("first@1.0.0").await.is_none());
        assert_eq!(
            orchestrator.latest_assessment("second@1.0.0").await.unwrap().id,
            second.id
        );
    }

    #[tokio::test]
    async fn test_clean_plugin_runs_and_is_recorded() {
        let orchestrator = orchestrator(unsigned_allowed()).await;
        let plugin = plugin("adder", "fn run(a, b) { log(\"adding\"); a + b }");

        let assessment = orchestrator.assess_plugin(&plugin, None).await;
        assert!(assessment.execution_allowed, "{:?}", assessment.blockers);
        assert_eq!(assessment.trust_level, TrustLevel::Untrusted);
        assert!(assessment.tests.as_ref().unwrap().all_passed());

        let result = orchestrator
            .execute_plugin(&plugin, "run", vec![serde_json::json!(2), serde_json::json!(3)])
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, Some(serde_json::json!(5)));

        let latest = orchestrator.latest_assessment(&plugin.id()).await.unwrap();
        assert_eq!(latest.id, assessment.id);
        assert_eq!(
            orchestrator.emergency().state(result.execution_id).await,
            Some(crate::emergency::EmergencyState::Resolved)
        );
    }

    #[tokio::test]
    async fn test_unsigned_plugin_blocked_when_signature_required() {
        let orchestrator = orchestrator(SentinelConfig::default()).await;
        let plugin = plugin("unsigned", "fn run() { 1 }");

        let result = orchestrator.execute_plugin(&plugin, "run", Vec::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Blocked));

        let assessment = orchestrator.latest_assessment(&plugin.id()).await.unwrap();
        assert!(assessment.blockers.contains(&ExecutionBlocker::InvalidSignature));
        assert_eq!(assessment.signature.trust_level, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn test_recommendations_cite_threat_lines() {
        let orchestrator = orchestrator(unsigned_allowed()).await;
        let plugin = plugin("evaluator", "fn run() {\n    eval(\"1 + 1\")\n}");

        let assessment = orchestrator.assess_plugin(&plugin, None).await;
        assert!(
            assessment
                .recommendations
                .iter()
                .any(|r| r.starts_with("DYN-001 at line 2:")),
            "{:?}",
            assessment.recommendations
        );
    }

    #[tokio::test]
    async fn test_quarantined_plugin_is_refused() {
        let orchestrator = orchestrator(SentinelConfig::default()).await;
        let plugin = plugin("quarantined", "fn run() { 1 }");
        orchestrator
            .emergency()
            .quarantine_plugin(&plugin.id(), "manual review", None)
            .await
            .unwrap();

        let result = orchestrator.execute_plugin(&plugin, "run", Vec::new()).await;
        assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Quarantined));

        let posture = orchestrator.security_posture().await;
        assert_eq!(posture.quarantined.len(), 1);
        assert_eq!(posture.active_executions, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let orchestrator = orchestrator(SentinelConfig::default()).await;
        orchestrator.start().await;
        orchestrator.shutdown().await;
        assert!(orchestrator.tasks.lock().await.is_empty());
    }
}
