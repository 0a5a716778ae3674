//! Behavior Monitor
//!
//! 実行ごとのイベント列を保持し、統計的ベースライン・固定パターン・タイミング異常から
//! リスクスコアを計算する。critical な評価では緊急対応に自動アクションを依頼する。

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::baseline::BaselineTracker;
use super::patterns::{builtin_patterns, match_pattern};
use super::types::{
    AnomalyIndicator, AnomalyKind, BehaviorPattern, BehaviorStatistics, PatternMatch,
    ThreatAssessment,
};
use crate::config::BehaviorConfig;
use crate::emergency::{
    EmergencyAction, EmergencyRequest, EmergencyTrigger, ForensicSource, ThreatResponder,
};
use crate::events::{EventSink, HostNotification, SecurityEvent, SecurityEventType};
use crate::types::{ExecutionId, Severity, ThreatLevel};

/// 頻度スコアに使う直近の時間
const FREQUENCY_WINDOW_SECS: i64 = 60;
/// フォレンジックに含めるイベント数
const FORENSIC_EVENT_LIMIT: usize = 500;

/// 1実行分の状態
struct ExecutionBehavior {
    plugin_id: String,
    active: bool,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    events: VecDeque<SecurityEvent>,
    baseline: BaselineTracker,
    anomalies: Vec<AnomalyIndicator>,
    /// パターンごとに最後に報告した一致時刻
    reported_matches: HashMap<String, DateTime<Utc>>,
    last_action_at: Option<Instant>,
    automated_actions: u32,
    forwarded: bool,
    latest: Option<ThreatAssessment>,
}

impl ExecutionBehavior {
    fn new(plugin_id: String, config: &BehaviorConfig) -> Self {
        let threshold = config.base_z_threshold / config.sensitivity.max(f64::EPSILON);
        Self {
            plugin_id,
            active: true,
            started_at: Utc::now(),
            stopped_at: None,
            events: VecDeque::new(),
            baseline: BaselineTracker::new(
                ChronoDuration::seconds(config.window_secs.max(1) as i64),
                threshold,
                config.min_baseline_samples,
            ),
            anomalies: Vec::new(),
            reported_matches: HashMap::new(),
            last_action_at: None,
            automated_actions: 0,
            forwarded: false,
            latest: None,
        }
    }

    fn is_new_match(&self, found: &PatternMatch) -> bool {
        self.reported_matches
            .get(&found.pattern_id)
            .map_or(true, |at| found.matched_at > *at)
    }
}

/// 振る舞い監視
#[derive(Clone)]
pub struct BehaviorMonitor {
    config: BehaviorConfig,
    executions: Arc<RwLock<HashMap<ExecutionId, ExecutionBehavior>>>,
    patterns: Arc<RwLock<Vec<BehaviorPattern>>>,
    responder: Arc<RwLock<Option<Arc<dyn ThreatResponder>>>>,
    events: Arc<dyn EventSink>,
    statistics: Arc<RwLock<BehaviorStatistics>>,
}

impl BehaviorMonitor {
    pub fn new(config: BehaviorConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            executions: Arc::new(RwLock::new(HashMap::new())),
            patterns: Arc::new(RwLock::new(builtin_patterns())),
            responder: Arc::new(RwLock::new(None)),
            events,
            statistics: Arc::new(RwLock::new(BehaviorStatistics::default())),
        }
    }

    /// 自動対応の依頼先を設定
    pub async fn set_responder(&self, responder: Arc<dyn ThreatResponder>) {
        *self.responder.write().await = Some(responder);
    }

    /// パターンを追加（同じIDは置き換え）
    pub async fn register_pattern(&self, pattern: BehaviorPattern) {
        let mut patterns = self.patterns.write().await;
        patterns.retain(|p| p.id != pattern.id);
        info!("Registered behavior pattern '{}'", pattern.id);
        patterns.push(pattern);
    }

    pub async fn patterns(&self) -> Vec<BehaviorPattern> {
        self.patterns.read().await.clone()
    }

    /// 実行の監視を開始
    pub async fn start_monitoring(&self, execution_id: ExecutionId, plugin_id: &str) {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution_id) {
            Some(existing) => existing.active = true,
            None => {
                executions.insert(
                    execution_id,
                    ExecutionBehavior::new(plugin_id.to_string(), &self.config),
                );
                self.statistics.write().await.executions_tracked += 1;
            }
        }
        debug!(%execution_id, plugin_id, "Behavior monitoring started");
    }

    /// 実行の監視を終了し、最終評価を返す（自動対応は行わない）
    pub async fn stop_monitoring(&self, execution_id: ExecutionId) -> Option<ThreatAssessment> {
        let patterns = self.patterns.read().await.clone();
        let mut executions = self.executions.write().await;
        let behavior = executions.get_mut(&execution_id)?;
        let assessment = assess(&self.config, execution_id, behavior, &patterns, Utc::now());
        behavior.latest = Some(assessment.clone());
        behavior.active = false;
        behavior.stopped_at = Some(Utc::now());
        debug!(
            %execution_id,
            risk_score = assessment.risk_score,
            "Behavior monitoring stopped"
        );
        Some(assessment)
    }

    /// イベントを記録する
    ///
    /// critical なイベント、または新しいパターン一致を完成させたイベントでは
    /// その場で評価して返す。
    pub async fn record_event(&self, event: SecurityEvent) -> Option<ThreatAssessment> {
        let execution_id = event.execution_id;
        let patterns = self.patterns.read().await.clone();
        let reference = Utc::now().max(event.timestamp);

        let analyze_now = {
            let mut executions = self.executions.write().await;
            if !executions.contains_key(&execution_id) {
                self.statistics.write().await.executions_tracked += 1;
            }
            let behavior = executions
                .entry(execution_id)
                .or_insert_with(|| ExecutionBehavior::new(event.plugin_id.clone(), &self.config));

            if let Some(anomaly) = behavior.baseline.observe(&event.event_type, event.timestamp) {
                debug!(%execution_id, "{}", anomaly.description);
                behavior.anomalies.push(anomaly);
                self.statistics.write().await.anomalies += 1;
            }

            let critical = event.severity == Severity::Critical;
            let event_type = event.event_type.clone();
            behavior.events.push_back(event);
            while behavior.events.len() > self.config.max_events_per_execution {
                behavior.events.pop_front();
            }

            behavior.events.make_contiguous();
            let events = behavior.events.as_slices().0;
            let completes_pattern = patterns
                .iter()
                .filter(|p| p.steps.last().is_some_and(|s| s.event_type == event_type))
                .filter_map(|p| match_pattern(p, events, reference))
                .any(|found| behavior.is_new_match(&found));

            critical || completes_pattern
        };
        self.statistics.write().await.events_recorded += 1;

        if analyze_now {
            self.analyze_at(execution_id, reference).await
        } else {
            None
        }
    }

    /// 実行を評価し、必要なら自動対応する
    #[instrument(skip(self))]
    pub async fn analyze_execution(&self, execution_id: ExecutionId) -> Option<ThreatAssessment> {
        self.analyze_at(execution_id, Utc::now()).await
    }

    async fn analyze_at(
        &self,
        execution_id: ExecutionId,
        now: DateTime<Utc>,
    ) -> Option<ThreatAssessment> {
        let patterns = self.patterns.read().await.clone();

        let (assessment, new_matches, active) = {
            let mut executions = self.executions.write().await;
            let behavior = executions.get_mut(&execution_id)?;
            let assessment = assess(&self.config, execution_id, behavior, &patterns, now);

            let new_matches: Vec<PatternMatch> = assessment
                .patterns
                .iter()
                .filter(|found| behavior.is_new_match(found))
                .cloned()
                .collect();
            for found in &new_matches {
                behavior
                    .reported_matches
                    .insert(found.pattern_id.clone(), found.matched_at);
                behavior.events.push_back(suspicious_event(
                    execution_id,
                    &behavior.plugin_id,
                    found,
                ));
            }
            behavior.latest = Some(assessment.clone());
            (assessment, new_matches, behavior.active)
        };

        {
            let mut stats = self.statistics.write().await;
            stats.assessments += 1;
            stats.pattern_matches += new_matches.len() as u64;
        }

        for found in &new_matches {
            warn!(
                %execution_id,
                pattern = %found.pattern_id,
                severity = %found.severity,
                "Suspicious behavior pattern matched"
            );
            self.events
                .emit(suspicious_event(execution_id, &assessment.plugin_id, found));
        }
        if assessment.threat_level >= ThreatLevel::Medium || !new_matches.is_empty() {
            info!(
                %execution_id,
                risk_score = assessment.risk_score,
                threat_level = %assessment.threat_level,
                "Threat assessment"
            );
        }
        self.events
            .notify(HostNotification::ThreatAssessment(assessment.clone()));

        if active {
            self.respond(&assessment).await;
        }
        Some(assessment)
    }

    /// 自動対応（クールダウンと上限つき）
    async fn respond(&self, assessment: &ThreatAssessment) {
        if !self.config.automated_response {
            return;
        }
        let Some(responder) = self.responder.read().await.clone() else {
            return;
        };

        let critical = assessment.threat_level == ThreatLevel::Critical;
        let pattern_driven = assessment.threat_level >= self.config.automation_min_level
            && !assessment.patterns.is_empty();
        if !critical && !pattern_driven {
            return;
        }

        let execution_id = assessment.execution_id;
        let action = assessment
            .recommended_actions
            .iter()
            .copied()
            .find(EmergencyAction::is_automatable);

        let (dispatch, forward) = {
            let mut executions = self.executions.write().await;
            let Some(behavior) = executions.get_mut(&execution_id) else {
                return;
            };
            let cooled = behavior.last_action_at.map_or(true, |at| {
                at.elapsed() >= Duration::from_secs(self.config.action_cooldown_secs)
            });
            let dispatch = match action {
                Some(action)
                    if cooled && behavior.automated_actions < self.config.max_automated_actions =>
                {
                    behavior.last_action_at = Some(Instant::now());
                    behavior.automated_actions += 1;
                    Some(action)
                }
                Some(action) => {
                    debug!(%execution_id, %action, "Automated action suppressed by cooldown or cap");
                    None
                }
                None => None,
            };
            let forward = critical && !behavior.forwarded;
            if forward {
                behavior.forwarded = true;
            }
            (dispatch, forward)
        };

        if let Some(action) = dispatch {
            let reason = format!(
                "automated response to {} threat (risk {:.0})",
                assessment.threat_level, assessment.risk_score
            );
            let outcome = responder
                .dispatch_action(execution_id, &assessment.plugin_id, action, &reason)
                .await;
            self.statistics.write().await.automated_actions += 1;
            info!(
                %execution_id,
                %action,
                success = outcome.success,
                "Automated action dispatched"
            );
        }

        if forward {
            let request = EmergencyRequest {
                execution_id,
                plugin_id: assessment.plugin_id.clone(),
                trigger: trigger_for(assessment),
                severity: Severity::Critical,
                description: format!(
                    "critical behavior assessment (risk {:.0}): {}",
                    assessment.risk_score,
                    assessment.indicators.join("; ")
                ),
            };
            let response = responder.trigger_emergency(request).await;
            debug!(%execution_id, success = response.success, "Critical assessment forwarded");
        }
    }

    /// 稼働中の全実行を評価
    pub async fn analyze_all(&self) -> Vec<ThreatAssessment> {
        let ids: Vec<ExecutionId> = self
            .executions
            .read()
            .await
            .iter()
            .filter(|(_, b)| b.active)
            .map(|(id, _)| *id)
            .collect();

        let mut assessments = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(assessment) = self.analyze_execution(id).await {
                assessments.push(assessment);
            }
        }
        assessments
    }

    /// 古いイベントと終了済みの実行を削除
    pub async fn prune(&self) -> usize {
        let retention = ChronoDuration::seconds(self.config.event_retention_secs as i64);
        let cutoff = Utc::now() - retention;
        let mut executions = self.executions.write().await;

        for behavior in executions.values_mut() {
            while behavior
                .events
                .front()
                .is_some_and(|e| e.timestamp < cutoff)
            {
                behavior.events.pop_front();
            }
            behavior.anomalies.retain(|a| a.detected_at >= cutoff);
        }

        let before = executions.len();
        executions.retain(|_, b| b.active || b.stopped_at.map_or(true, |at| at >= cutoff));
        before - executions.len()
    }

    /// 定期評価タスクを起動
    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let interval = Duration::from_millis(self.config.analysis_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let assessments = monitor.analyze_all().await;
                        let removed = monitor.prune().await;
                        debug!(assessed = assessments.len(), removed, "Behavior sweep");
                    }
                }
            }
            debug!("Behavior sweeper stopped");
        })
    }

    pub async fn latest_assessment(&self, execution_id: ExecutionId) -> Option<ThreatAssessment> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .and_then(|b| b.latest.clone())
    }

    pub async fn events_for(&self, execution_id: ExecutionId) -> Vec<SecurityEvent> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|b| b.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// プラグインの実行のうち最も新しい評価
    pub async fn latest_for_plugin(&self, plugin_id: &str) -> Option<ThreatAssessment> {
        self.executions
            .read()
            .await
            .values()
            .filter(|b| b.plugin_id == plugin_id)
            .filter_map(|b| b.latest.as_ref())
            .max_by_key(|a| a.assessed_at)
            .cloned()
    }

    /// 直近の評価（新しい順）
    pub async fn recent_assessments(&self, limit: usize) -> Vec<ThreatAssessment> {
        let executions = self.executions.read().await;
        let mut latest: Vec<ThreatAssessment> =
            executions.values().filter_map(|b| b.latest.clone()).collect();
        latest.sort_by(|a, b| b.assessed_at.cmp(&a.assessed_at));
        latest.truncate(limit);
        latest
    }

    pub async fn is_monitoring(&self, execution_id: ExecutionId) -> bool {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .is_some_and(|b| b.active)
    }

    pub async fn tracked_count(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn statistics(&self) -> BehaviorStatistics {
        self.statistics.read().await.clone()
    }
}

/// リスクスコアの計算
fn assess(
    config: &BehaviorConfig,
    execution_id: ExecutionId,
    behavior: &mut ExecutionBehavior,
    patterns: &[BehaviorPattern],
    now: DateTime<Utc>,
) -> ThreatAssessment {
    let window_start = now - ChronoDuration::seconds(config.window_secs.max(1) as i64);
    let frequency_start = now - ChronoDuration::seconds(FREQUENCY_WINDOW_SECS);
    behavior.events.make_contiguous();
    let events = behavior.events.as_slices().0;
    let recent: Vec<&SecurityEvent> = events
        .iter()
        .filter(|e| e.timestamp >= window_start && e.timestamp <= now)
        .collect();

    let mut indicators = Vec::new();

    // 深刻度の分布
    let mut histogram: HashMap<Severity, usize> = HashMap::new();
    for event in &recent {
        *histogram.entry(event.severity).or_insert(0) += 1;
    }
    let severity_score = histogram
        .iter()
        .map(|(severity, count)| {
            let weight = match severity {
                Severity::Critical => 10.0,
                Severity::High => 5.0,
                Severity::Medium => 2.0,
                Severity::Low => 0.5,
                Severity::Info => 0.0,
            };
            weight * *count as f64
        })
        .sum::<f64>()
        .min(40.0);
    for severity in [Severity::Critical, Severity::High] {
        if let Some(count) = histogram.get(&severity) {
            indicators.push(format!("{} {} severity events", count, severity));
        }
    }

    let per_minute = events
        .iter()
        .filter(|e| e.timestamp >= frequency_start && e.timestamp <= now)
        .count();
    let frequency_score = (per_minute as f64 * 0.5).min(20.0);

    let distinct: BTreeSet<&str> = recent.iter().map(|e| e.event_type.as_str()).collect();
    let diversity_score = (distinct.len() as f64 * 3.0).min(15.0);

    let matches: Vec<PatternMatch> = patterns
        .iter()
        .filter_map(|p| match_pattern(p, events, now))
        .collect();
    let pattern_score = matches.iter().map(|m| m.weight).sum::<f64>().min(50.0);
    for found in &matches {
        indicators.push(format!("pattern {}: {}", found.pattern_id, found.description));
    }

    let mut anomalies: Vec<AnomalyIndicator> = behavior
        .anomalies
        .iter()
        .filter(|a| a.detected_at >= window_start)
        .cloned()
        .collect();
    if let Some(burst) = timing_burst(&recent, config) {
        anomalies.push(burst);
    }
    for anomaly in &anomalies {
        indicators.push(anomaly.description.clone());
    }
    let anomaly_score = (anomalies.len() as f64 * 10.0).min(20.0);

    let risk_score = (severity_score + frequency_score + diversity_score + pattern_score + anomaly_score)
        .clamp(0.0, 100.0);

    // 一致したパターンの深刻度を下限とする
    let pattern_floor = matches
        .iter()
        .map(|m| m.severity.threat_level())
        .max()
        .unwrap_or(ThreatLevel::None);
    let threat_level = ThreatLevel::from_risk_score(risk_score).max(pattern_floor);

    let mut recommended: Vec<EmergencyAction> = patterns
        .iter()
        .filter(|p| matches.iter().any(|m| m.pattern_id == p.id))
        .flat_map(|p| p.actions.iter().copied())
        .chain(default_actions(threat_level).iter().copied())
        .collect();
    recommended.sort_by_key(|a| std::cmp::Reverse(a.priority()));
    recommended.dedup();

    ThreatAssessment {
        execution_id,
        plugin_id: behavior.plugin_id.clone(),
        risk_score,
        threat_level,
        indicators,
        patterns: matches,
        anomalies,
        recommended_actions: recommended,
        event_count: events.len(),
        assessed_at: now,
    }
}

fn default_actions(level: ThreatLevel) -> &'static [EmergencyAction] {
    match level {
        ThreatLevel::Critical => &[
            EmergencyAction::Terminate,
            EmergencyAction::Quarantine,
            EmergencyAction::ForensicCapture,
            EmergencyAction::Alert,
        ],
        ThreatLevel::High => &[EmergencyAction::Isolate, EmergencyAction::Alert],
        ThreatLevel::Medium => &[EmergencyAction::Restrict, EmergencyAction::Monitor],
        ThreatLevel::Low => &[EmergencyAction::Monitor],
        ThreatLevel::None => &[],
    }
}

/// 短い間隔で続くイベントの連なり
fn timing_burst(recent: &[&SecurityEvent], config: &BehaviorConfig) -> Option<AnomalyIndicator> {
    let gap = ChronoDuration::milliseconds(config.burst_gap_ms as i64);
    let mut longest = 1;
    let mut run = 1;
    for pair in recent.windows(2) {
        if pair[1].timestamp - pair[0].timestamp < gap {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 1;
        }
    }
    if recent.len() < 2 || longest < config.burst_threshold {
        return None;
    }
    Some(AnomalyIndicator {
        kind: AnomalyKind::TimingBurst,
        event_type: None,
        z_score: None,
        description: format!(
            "burst of {} events less than {} ms apart",
            longest, config.burst_gap_ms
        ),
        detected_at: recent.last().map_or_else(Utc::now, |e| e.timestamp),
    })
}

fn suspicious_event(execution_id: ExecutionId, plugin_id: &str, found: &PatternMatch) -> SecurityEvent {
    SecurityEvent::new(
        SecurityEventType::SuspiciousBehavior,
        found.severity,
        execution_id,
        plugin_id,
    )
    .at(found.matched_at)
    .with_metadata("pattern", found.pattern_id.clone())
    .with_metadata("description", found.description.clone())
    .with_metadata("event_count", found.event_count)
}

fn trigger_for(assessment: &ThreatAssessment) -> EmergencyTrigger {
    let has = |id: &str| assessment.patterns.iter().any(|p| p.pattern_id == id);
    if has("sandbox-escape") {
        EmergencyTrigger::SandboxEscape
    } else if has("data-exfiltration") {
        EmergencyTrigger::DataExfiltration
    } else if has("resource-exhaustion") {
        EmergencyTrigger::ResourceExhaustion
    } else {
        EmergencyTrigger::SuspiciousBehavior
    }
}

#[async_trait]
impl ForensicSource for BehaviorMonitor {
    fn name(&self) -> &'static str {
        "behavior-monitor"
    }

    async fn collect(&self, execution_id: ExecutionId) -> Option<Value> {
        let executions = self.executions.read().await;
        let behavior = executions.get(&execution_id)?;
        let skip = behavior.events.len().saturating_sub(FORENSIC_EVENT_LIMIT);
        let events: Vec<&SecurityEvent> = behavior.events.iter().skip(skip).collect();
        let baseline: Vec<Value> = behavior
            .baseline
            .snapshot()
            .into_iter()
            .map(|(event_type, mean, std_dev, windows)| {
                json!({
                    "event_type": event_type,
                    "mean": mean,
                    "std_dev": std_dev,
                    "windows": windows,
                })
            })
            .collect();
        Some(json!({
            "plugin_id": behavior.plugin_id,
            "started_at": behavior.started_at,
            "events": events,
            "anomalies": behavior.anomalies,
            "baseline": baseline,
            "latest_assessment": behavior.latest,
            "automated_actions": behavior.automated_actions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::{ActionOutcome, EmergencyResponse};
    use crate::events::NullSink;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// 依頼を記録するだけの応答者
    #[derive(Default)]
    struct RecordingResponder {
        actions: Mutex<Vec<EmergencyAction>>,
        emergencies: Mutex<Vec<EmergencyTrigger>>,
    }

    #[async_trait]
    impl ThreatResponder for RecordingResponder {
        async fn trigger_emergency(&self, request: EmergencyRequest) -> EmergencyResponse {
            self.emergencies.lock().unwrap().push(request.trigger);
            EmergencyResponse::rejected("recorded")
        }

        async fn dispatch_action(
            &self,
            _execution_id: ExecutionId,
            _plugin_id: &str,
            action: EmergencyAction,
            _reason: &str,
        ) -> ActionOutcome {
            self.actions.lock().unwrap().push(action);
            ActionOutcome {
                action,
                success: true,
                message: "recorded".to_string(),
                duration_ms: 0,
            }
        }
    }

    fn event(id: ExecutionId, event_type: SecurityEventType, severity: Severity) -> SecurityEvent {
        SecurityEvent::new(event_type, severity, id, "p@1.0.0")
    }

    #[tokio::test]
    async fn test_resource_exhaustion_triggers_restrictive_action() {
        let monitor = BehaviorMonitor::new(BehaviorConfig::default(), Arc::new(NullSink));
        let responder = Arc::new(RecordingResponder::default());
        monitor.set_responder(responder.clone()).await;

        let id = Uuid::new_v4();
        monitor.start_monitoring(id, "p@1.0.0").await;

        let mut last = None;
        for _ in 0..10 {
            last = monitor
                .record_event(event(id, SecurityEventType::ResourceViolation, Severity::Medium))
                .await;
        }
        let assessment = last.expect("tenth violation completes the pattern");
        assert!(assessment
            .patterns
            .iter()
            .any(|p| p.pattern_id == "resource-exhaustion"));
        assert!(assessment.threat_level >= ThreatLevel::High);

        let events = monitor.events_for(id).await;
        assert!(events
            .iter()
            .any(|e| e.event_type == SecurityEventType::SuspiciousBehavior));

        let actions = responder.actions.lock().unwrap().clone();
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            EmergencyAction::Isolate | EmergencyAction::Restrict
        ));
    }

    #[tokio::test]
    async fn test_pattern_reported_once() {
        let monitor = BehaviorMonitor::new(BehaviorConfig::default(), Arc::new(NullSink));
        let id = Uuid::new_v4();
        monitor.start_monitoring(id, "p@1.0.0").await;
        for _ in 0..5 {
            monitor
                .record_event(event(id, SecurityEventType::PermissionDenied, Severity::Medium))
                .await;
        }
        monitor.analyze_execution(id).await;
        monitor.analyze_execution(id).await;

        let suspicious = monitor
            .events_for(id)
            .await
            .into_iter()
            .filter(|e| e.event_type == SecurityEventType::SuspiciousBehavior)
            .count();
        assert_eq!(suspicious, 1);
        assert_eq!(monitor.statistics().await.pattern_matches, 1);
    }

    #[tokio::test]
    async fn test_quiet_execution_is_low_risk() {
        let monitor = BehaviorMonitor::new(BehaviorConfig::default(), Arc::new(NullSink));
        let id = Uuid::new_v4();
        monitor.start_monitoring(id, "p@1.0.0").await;
        monitor
            .record_event(event(id, SecurityEventType::Log, Severity::Info))
            .await;
        monitor
            .record_event(event(id, SecurityEventType::StorageAccess, Severity::Info))
            .await;

        let assessment = monitor.analyze_execution(id).await.unwrap();
        assert!(assessment.risk_score < 20.0, "{}", assessment.risk_score);
        assert_eq!(assessment.threat_level, ThreatLevel::None);
        assert!(assessment.recommended_actions.is_empty());
    }

    #[tokio::test]
    async fn test_critical_event_is_forwarded_once() {
        let monitor = BehaviorMonitor::new(BehaviorConfig::default(), Arc::new(NullSink));
        let responder = Arc::new(RecordingResponder::default());
        monitor.set_responder(responder.clone()).await;
        let id = Uuid::new_v4();
        monitor.start_monitoring(id, "p@1.0.0").await;

        for _ in 0..3 {
            monitor
                .record_event(event(id, SecurityEventType::CapabilityDenied, Severity::High))
                .await;
        }
        monitor.analyze_execution(id).await;

        let emergencies = responder.emergencies.lock().unwrap().clone();
        assert_eq!(emergencies, vec![EmergencyTrigger::SandboxEscape]);
        let actions = responder.actions.lock().unwrap().clone();
        assert_eq!(actions.first(), Some(&EmergencyAction::Terminate));
    }

    #[tokio::test]
    async fn test_timing_burst_detected() {
        let config = BehaviorConfig {
            burst_threshold: 5,
            ..Default::default()
        };
        let monitor = BehaviorMonitor::new(config, Arc::new(NullSink));
        let id = Uuid::new_v4();
        monitor.start_monitoring(id, "p@1.0.0").await;
        let start = Utc::now() - ChronoDuration::seconds(1);
        for i in 0..6 {
            monitor
                .record_event(
                    event(id, SecurityEventType::Log, Severity::Info)
                        .at(start + ChronoDuration::milliseconds(i * 10)),
                )
                .await;
        }
        let assessment = monitor.analyze_execution(id).await.unwrap();
        assert!(assessment
            .anomalies
            .iter()
            .any(|a| a.kind == AnomalyKind::TimingBurst));
    }

    #[tokio::test]
    async fn test_forensics_and_stop() {
        let monitor = BehaviorMonitor::new(BehaviorConfig::default(), Arc::new(NullSink));
        let id = Uuid::new_v4();
        monitor.start_monitoring(id, "p@1.0.0").await;
        monitor
            .record_event(event(id, SecurityEventType::FileAccess, Severity::Info))
            .await;

        let final_assessment = monitor.stop_monitoring(id).await.unwrap();
        assert_eq!(final_assessment.event_count, 1);
        assert!(!monitor.is_monitoring(id).await);

        let data = monitor.collect(id).await.unwrap();
        assert_eq!(data["events"].as_array().unwrap().len(), 1);
        assert!(monitor.collect(Uuid::new_v4()).await.is_none());
    }
}
