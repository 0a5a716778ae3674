//! Resource Monitor
//!
//! 実行ごとに一定間隔でサンプルを取り、制限超過を違反として記録する。
//! 緊急条件では実行を直ちに終了させ、監視を止める。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::sampler::{SystemSampler, UsageSampler};
use super::types::{
    EmergencyCondition, ExecutionUsageSnapshot, ResourceLimits, ResourceStatistics, ResourceType,
    ResourceUsage, ResourceViolation, SampleEvaluation, ViolationSeverity,
};
use crate::config::ResourceMonitorConfig;
use crate::emergency::{EmergencyRequest, EmergencyTrigger, ForensicSource, ThreatResponder};
use crate::events::{EventSink, HostNotification, SecurityEvent, SecurityEventType};
use crate::sandbox::{ExecutionController, TerminationReason};
use crate::types::{ExecutionId, Severity};

/// 終了済みレコードの保持上限
const MAX_FINISHED_RECORDS: usize = 1_000;

/// 1サンプルを評価する（副作用なし）
///
/// 違反は `measured > limit` のみ。緊急条件は優先順に1つだけ選ぶ：
/// ハードタイムアウト、ヒープ、CPU、システムメモリ、システムロード。
pub fn evaluate_sample(
    usage: &ResourceUsage,
    limits: &ResourceLimits,
    config: &ResourceMonitorConfig,
) -> SampleEvaluation {
    let mut evaluation = SampleEvaluation {
        violations: usage
            .get_violations(limits)
            .into_iter()
            .map(|(resource, measured, limit)| {
                (
                    resource,
                    ViolationSeverity::from_ratio(measured, limit),
                    measured,
                    limit,
                )
            })
            .collect(),
        throttle: usage.cpu_percent > config.throttle_cpu_percent,
        emergency: emergency_condition(usage, limits, config),
    };

    if let Some(condition) = &evaluation.emergency {
        match evaluation
            .violations
            .iter_mut()
            .find(|(resource, ..)| *resource == condition.resource_type)
        {
            Some(violation) => violation.1 = ViolationSeverity::Emergency,
            None => evaluation.violations.push((
                condition.resource_type,
                ViolationSeverity::Emergency,
                condition.measured,
                condition.threshold,
            )),
        }
    }

    evaluation
}

fn emergency_condition(
    usage: &ResourceUsage,
    limits: &ResourceLimits,
    config: &ResourceMonitorConfig,
) -> Option<EmergencyCondition> {
    let condition = |resource_type, measured: f64, threshold: f64| EmergencyCondition {
        resource_type,
        measured,
        threshold,
    };

    if limits.hard_timeout_ms > 0 && usage.elapsed_ms >= limits.hard_timeout_ms {
        return Some(condition(
            ResourceType::ExecutionTime,
            usage.elapsed_ms as f64,
            limits.hard_timeout_ms as f64,
        ));
    }

    let heap_threshold = limits.max_heap_bytes as f64 * config.emergency_memory_percent / 100.0;
    if usage.heap_bytes > limits.max_heap_bytes && usage.heap_bytes as f64 >= heap_threshold {
        return Some(condition(
            ResourceType::HeapMemory,
            usage.heap_bytes as f64,
            heap_threshold,
        ));
    }

    if usage.cpu_percent > limits.max_cpu_percent
        && usage.cpu_percent >= config.emergency_cpu_percent
    {
        return Some(condition(
            ResourceType::Cpu,
            usage.cpu_percent,
            config.emergency_cpu_percent,
        ));
    }

    if let Some(system) = &usage.system {
        if system.memory_used_percent >= config.emergency_system_memory_percent {
            return Some(condition(
                ResourceType::SystemMemory,
                system.memory_used_percent,
                config.emergency_system_memory_percent,
            ));
        }
        if system.load_percent >= config.emergency_system_load_percent {
            return Some(condition(
                ResourceType::SystemLoad,
                system.load_percent,
                config.emergency_system_load_percent,
            ));
        }
    }

    None
}

/// 実行ごとの監視レコード
struct ExecutionRecord {
    plugin_id: String,
    limits: ResourceLimits,
    history: VecDeque<ResourceUsage>,
    /// 直近の違反（`history_retention` 件まで。総数は `violation_counts`）
    violations: VecDeque<ResourceViolation>,
    violation_counts: HashMap<ResourceType, u64>,
    statistics: ResourceStatistics,
    /// 前回サンプルの（累積CPU時間, 経過時間）
    last_cpu_sample: Option<(u64, u64)>,
    active: bool,
    emergency: Option<EmergencyCondition>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    fn new(plugin_id: String, limits: ResourceLimits) -> Self {
        Self {
            plugin_id,
            limits,
            history: VecDeque::new(),
            violations: VecDeque::new(),
            violation_counts: HashMap::new(),
            statistics: ResourceStatistics::default(),
            last_cpu_sample: None,
            active: true,
            emergency: None,
            started_at: Utc::now(),
            stopped_at: None,
        }
    }

    /// 区間CPU使用率（前回サンプルからの差分）
    fn cpu_percent(&mut self, cpu_time_ms: u64, elapsed_ms: u64) -> f64 {
        let (prev_cpu, prev_elapsed) = self.last_cpu_sample.unwrap_or((0, 0));
        self.last_cpu_sample = Some((cpu_time_ms, elapsed_ms));
        let wall = elapsed_ms.saturating_sub(prev_elapsed);
        if wall == 0 {
            return 0.0;
        }
        let cpu = cpu_time_ms.saturating_sub(prev_cpu);
        (cpu as f64 / wall as f64 * 100.0).min(100.0)
    }
}

/// 監視レポート（監視終了時に返す）
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MonitoringReport {
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    pub statistics: ResourceStatistics,
    pub violation_counts: HashMap<ResourceType, u64>,
    pub emergency: Option<EmergencyCondition>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

/// リソース監視
#[derive(Clone)]
pub struct ResourceMonitor {
    config: Arc<ResourceMonitorConfig>,
    usage_sampler: Arc<dyn UsageSampler>,
    system_sampler: Arc<dyn SystemSampler>,
    controller: Arc<dyn ExecutionController>,
    events: Arc<dyn EventSink>,
    responder: Arc<RwLock<Option<Arc<dyn ThreatResponder>>>>,
    tasks: Arc<RwLock<HashMap<ExecutionId, JoinHandle<()>>>>,
    records: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
}

impl ResourceMonitor {
    pub fn new(
        config: ResourceMonitorConfig,
        usage_sampler: Arc<dyn UsageSampler>,
        system_sampler: Arc<dyn SystemSampler>,
        controller: Arc<dyn ExecutionController>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            usage_sampler,
            system_sampler,
            controller,
            events,
            responder: Arc::new(RwLock::new(None)),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 緊急対応の送り先を設定
    pub async fn set_responder(&self, responder: Arc<dyn ThreatResponder>) {
        *self.responder.write().await = Some(responder);
    }

    /// 監視を開始（制限未指定なら既定値）
    pub async fn start_monitoring(
        &self,
        execution_id: ExecutionId,
        plugin_id: impl Into<String>,
        limits: Option<ResourceLimits>,
    ) -> crate::Result<()> {
        let limits = limits.unwrap_or_else(|| self.config.default_limits.clone());
        limits
            .validate()
            .map_err(crate::Error::InvalidInput)?;

        let plugin_id = plugin_id.into();
        {
            let mut records = self.records.write().await;
            if records.get(&execution_id).is_some_and(|r| r.active) {
                debug!(%execution_id, "Execution is already monitored");
                return Ok(());
            }
            records.insert(execution_id, ExecutionRecord::new(plugin_id.clone(), limits));
        }

        let monitor = self.clone();
        let interval = Duration::from_millis(self.config.sample_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                let Some(snapshot) = monitor.usage_sampler.sample(execution_id).await else {
                    debug!(%execution_id, "Execution no longer reports usage; sampling stops");
                    break;
                };

                match monitor.process_sample(execution_id, snapshot).await {
                    Some(evaluation) if evaluation.emergency.is_some() => break,
                    Some(_) => {}
                    None => break,
                }
            }
        });

        self.tasks.write().await.insert(execution_id, handle);
        info!(%execution_id, plugin = %plugin_id, "Resource monitoring started");
        Ok(())
    }

    /// 監視を停止（違反カウンタは保持）
    pub async fn stop_monitoring(&self, execution_id: ExecutionId) -> Option<MonitoringReport> {
        if let Some(task) = self.tasks.write().await.remove(&execution_id) {
            task.abort();
        }

        let report = {
            let mut records = self.records.write().await;
            let record = records.get_mut(&execution_id)?;
            if record.active {
                record.active = false;
                record.stopped_at = Some(Utc::now());
            }
            MonitoringReport {
                execution_id,
                plugin_id: record.plugin_id.clone(),
                statistics: record.statistics.clone(),
                violation_counts: record.violation_counts.clone(),
                emergency: record.emergency.clone(),
                started_at: record.started_at,
                stopped_at: record.stopped_at.unwrap_or_else(Utc::now),
            }
        };

        self.prune_finished_over_capacity().await;
        debug!(%execution_id, samples = report.statistics.sample_count, "Resource monitoring stopped");
        Some(report)
    }

    /// サンプルを1件処理する（監視対象外なら `None`）
    pub async fn process_sample(
        &self,
        execution_id: ExecutionId,
        snapshot: ExecutionUsageSnapshot,
    ) -> Option<SampleEvaluation> {
        let system = self.system_sampler.snapshot();

        let (evaluation, plugin_id, violations) = {
            let mut records = self.records.write().await;
            let record = records.get_mut(&execution_id).filter(|r| r.active)?;

            let usage = ResourceUsage {
                execution_id,
                timestamp: Utc::now(),
                heap_bytes: snapshot.heap_bytes,
                rss_bytes: system.process_rss_bytes,
                external_bytes: snapshot.external_bytes,
                cpu_percent: record.cpu_percent(snapshot.cpu_time_ms, snapshot.elapsed_ms),
                cpu_time_ms: snapshot.cpu_time_ms,
                elapsed_ms: snapshot.elapsed_ms,
                io: snapshot.io,
                system: Some(system),
            };

            let evaluation = evaluate_sample(&usage, &record.limits, &self.config);

            let violations: Vec<ResourceViolation> = evaluation
                .violations
                .iter()
                .map(|(resource_type, severity, measured, limit)| ResourceViolation {
                    id: Uuid::new_v4(),
                    execution_id,
                    plugin_id: record.plugin_id.clone(),
                    resource_type: *resource_type,
                    severity: *severity,
                    measured: *measured,
                    limit: *limit,
                    timestamp: usage.timestamp,
                    message: format!(
                        "{} at {:.1} exceeds {:.1}",
                        resource_type, measured, limit
                    ),
                })
                .collect();

            for violation in &violations {
                *record
                    .violation_counts
                    .entry(violation.resource_type)
                    .or_insert(0) += 1;
                record.violations.push_back(violation.clone());
            }
            let retention = self.config.history_retention.max(1);
            while record.violations.len() > retention {
                record.violations.pop_front();
            }

            record.statistics.record(&usage, !violations.is_empty());
            if evaluation.throttle {
                record.statistics.throttle_count += 1;
            }
            if let Some(condition) = &evaluation.emergency {
                record.emergency = Some(condition.clone());
            }

            record.history.push_back(usage);
            while record.history.len() > retention {
                record.history.pop_front();
            }

            (evaluation, record.plugin_id.clone(), violations)
        };

        for violation in &violations {
            self.report_violation(violation);
        }

        if evaluation.throttle {
            let duration = Duration::from_millis(self.config.throttle_duration_ms);
            if self.controller.throttle(execution_id, duration).await {
                debug!(%execution_id, "Execution throttled for {:?}", duration);
            }
        }

        if let Some(condition) = &evaluation.emergency {
            self.handle_emergency(execution_id, &plugin_id, condition).await;
        }

        Some(evaluation)
    }

    fn report_violation(&self, violation: &ResourceViolation) {
        match violation.severity {
            ViolationSeverity::Warning => debug!(
                execution_id = %violation.execution_id,
                "Resource violation: {}",
                violation.message
            ),
            _ => warn!(
                execution_id = %violation.execution_id,
                severity = ?violation.severity,
                "Resource violation: {}",
                violation.message
            ),
        }

        self.events.emit(
            SecurityEvent::new(
                SecurityEventType::ResourceViolation,
                violation.severity.severity(),
                violation.execution_id,
                violation.plugin_id.clone(),
            )
            .with_metadata("resource", violation.resource_type.as_str())
            .with_metadata("measured", violation.measured)
            .with_metadata("limit", violation.limit)
            .with_metadata("violation_severity", json!(violation.severity)),
        );
        self.events
            .notify(HostNotification::ResourceViolation(violation.clone()));
    }

    /// 緊急条件：終了を最優先し、インシデント処理は待たない
    async fn handle_emergency(
        &self,
        execution_id: ExecutionId,
        plugin_id: &str,
        condition: &EmergencyCondition,
    ) {
        error!(
            %execution_id,
            resource = condition.resource_type.as_str(),
            measured = condition.measured,
            threshold = condition.threshold,
            "Emergency resource condition; terminating execution"
        );

        let reason = match condition.resource_type {
            ResourceType::ExecutionTime => TerminationReason::Timeout,
            ResourceType::HeapMemory => TerminationReason::MemoryLimit,
            _ => TerminationReason::ResourceLimit,
        };
        self.controller.terminate(execution_id, reason).await;

        if let Some(responder) = self.responder.read().await.clone() {
            let request = EmergencyRequest {
                execution_id,
                plugin_id: plugin_id.to_string(),
                trigger: EmergencyTrigger::ResourceExhaustion,
                severity: Severity::Critical,
                description: format!(
                    "{} reached {:.1} (threshold {:.1})",
                    condition.resource_type, condition.measured, condition.threshold
                ),
            };
            tokio::spawn(async move {
                let response = responder.trigger_emergency(request).await;
                debug!(%execution_id, success = response.success, "Resource emergency handled");
            });
        }

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&execution_id) {
                record.active = false;
                record.stopped_at = Some(Utc::now());
            }
        }
        // 監視タスク自身から呼ばれることもあるため最後に止める
        if let Some(task) = self.tasks.write().await.remove(&execution_id) {
            task.abort();
        }
    }

    async fn prune_finished_over_capacity(&self) {
        let mut records = self.records.write().await;
        let finished = records.values().filter(|r| !r.active).count();
        if finished <= MAX_FINISHED_RECORDS {
            return;
        }

        let mut stopped: Vec<(ExecutionId, DateTime<Utc>)> = records
            .iter()
            .filter_map(|(id, r)| r.stopped_at.filter(|_| !r.active).map(|at| (*id, at)))
            .collect();
        stopped.sort_by_key(|(_, at)| *at);
        for (id, _) in stopped.into_iter().take(finished - MAX_FINISHED_RECORDS) {
            records.remove(&id);
        }
    }

    /// 一定時間より前に終了したレコードを削除
    pub async fn prune_finished(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(1));
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.active || r.stopped_at.map_or(true, |at| at > cutoff));
        before - records.len()
    }

    /// 監視中か
    pub async fn is_monitoring(&self, execution_id: ExecutionId) -> bool {
        self.records
            .read()
            .await
            .get(&execution_id)
            .is_some_and(|r| r.active)
    }

    /// 監視中の件数
    pub async fn monitored_count(&self) -> usize {
        self.records.read().await.values().filter(|r| r.active).count()
    }

    /// 最新のサンプル
    pub async fn current_usage(&self, execution_id: ExecutionId) -> Option<ResourceUsage> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .and_then(|r| r.history.back().cloned())
    }

    /// サンプル履歴
    pub async fn usage_history(&self, execution_id: ExecutionId) -> Vec<ResourceUsage> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .map(|r| r.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 違反の一覧
    pub async fn violations(&self, execution_id: ExecutionId) -> Vec<ResourceViolation> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .map(|r| r.violations.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 種別ごとの違反カウンタ
    pub async fn violation_counts(&self, execution_id: ExecutionId) -> HashMap<ResourceType, u64> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .map(|r| r.violation_counts.clone())
            .unwrap_or_default()
    }

    /// 統計情報
    pub async fn statistics(&self, execution_id: ExecutionId) -> Option<ResourceStatistics> {
        self.records
            .read()
            .await
            .get(&execution_id)
            .map(|r| r.statistics.clone())
    }

    /// 全監視タスクを止める
    pub async fn shutdown(&self) {
        let tasks: Vec<(ExecutionId, JoinHandle<()>)> =
            self.tasks.write().await.drain().collect();
        for (_, task) in &tasks {
            task.abort();
        }
        let mut records = self.records.write().await;
        for record in records.values_mut().filter(|r| r.active) {
            record.active = false;
            record.stopped_at = Some(Utc::now());
        }
        info!(stopped = tasks.len(), "Resource monitor shut down");
    }
}

#[async_trait]
impl ForensicSource for ResourceMonitor {
    fn name(&self) -> &'static str {
        "resource-monitor"
    }

    async fn collect(&self, execution_id: ExecutionId) -> Option<Value> {
        let records = self.records.read().await;
        let record = records.get(&execution_id)?;
        Some(json!({
            "plugin_id": record.plugin_id,
            "limits": record.limits,
            "history": record.history,
            "violations": record.violations,
            "violation_counts": record.violation_counts,
            "statistics": record.statistics,
            "emergency": record.emergency,
        }))
    }
}
