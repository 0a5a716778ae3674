//! Emergency Controller
//!
//! 実行ごとの状態機械（active → incident-triggered → action-execution → resolved | quarantined）
//! と、深刻度に応じた段階的な対応。終了処理を最優先し、付随アクションは時間制限つきで実行する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::quarantine::QuarantineRegistry;
use super::responder::{AlertSink, ForensicSource, ThreatResponder, TracingAlertSink};
use super::store::IncidentStore;
use super::types::{
    ActionOutcome, EmergencyAction, EmergencyIncident, EmergencyRequest, EmergencyResponse,
    EmergencyState, ForensicArtifact, QuarantineRecord,
};
use crate::config::EmergencyConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, ExecutionSignal, HostNotification, SecurityEvent, SecurityEventType};
use crate::sandbox::{ExecutionController, TerminationReason};
use crate::signature::trust_store::write_atomic;
use crate::types::{ExecutionId, Severity};

/// 実行1件分の緊急対応状態
#[derive(Debug, Clone)]
struct ExecutionEmergency {
    plugin_id: String,
    state: EmergencyState,
    incident_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

impl ExecutionEmergency {
    fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            state: EmergencyState::Active,
            incident_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// 緊急対応コントローラー
pub struct EmergencyController {
    config: EmergencyConfig,
    executions: Arc<dyn ExecutionController>,
    events: Arc<dyn EventSink>,
    alerts: Arc<dyn AlertSink>,
    states: RwLock<HashMap<ExecutionId, ExecutionEmergency>>,
    incidents: IncidentStore,
    quarantine: RwLock<QuarantineRegistry>,
    forensic_sources: RwLock<Vec<Weak<dyn ForensicSource>>>,
}

impl EmergencyController {
    /// 設定されたインシデントディレクトリと隔離レジストリを開く
    pub async fn open(
        config: EmergencyConfig,
        executions: Arc<dyn ExecutionController>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let incidents = match &config.incident_dir {
            Some(dir) => IncidentStore::open(dir, config.max_incidents_in_memory).await?,
            None => IncidentStore::in_memory(config.max_incidents_in_memory),
        };
        let quarantine = match &config.quarantine_path {
            Some(path) => QuarantineRegistry::load(path).await?,
            None => QuarantineRegistry::in_memory(),
        };

        Ok(Self {
            config,
            executions,
            events,
            alerts: Arc::new(TracingAlertSink),
            states: RwLock::new(HashMap::new()),
            incidents,
            quarantine: RwLock::new(quarantine),
            forensic_sources: RwLock::new(Vec::new()),
        })
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// フォレンジック情報の提供元を登録（弱参照で保持）
    pub async fn register_forensic_source(&self, source: &Arc<dyn ForensicSource>) {
        debug!("Registered forensic source '{}'", source.name());
        self.forensic_sources.write().await.push(Arc::downgrade(source));
    }

    /// 実行を active として登録
    pub async fn register_execution(&self, execution_id: ExecutionId, plugin_id: &str) {
        self.states
            .write()
            .await
            .entry(execution_id)
            .or_insert_with(|| ExecutionEmergency::new(plugin_id));
    }

    /// インシデントなしで終了した実行を resolved にする
    pub async fn complete_execution(&self, execution_id: ExecutionId) -> bool {
        let mut states = self.states.write().await;
        match states.get_mut(&execution_id) {
            Some(entry) if entry.state == EmergencyState::Active => {
                entry.state = EmergencyState::Resolved;
                entry.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub async fn state(&self, execution_id: ExecutionId) -> Option<EmergencyState> {
        self.states.read().await.get(&execution_id).map(|e| e.state)
    }

    pub async fn incident_for_execution(&self, execution_id: ExecutionId) -> Option<Uuid> {
        self.states
            .read()
            .await
            .get(&execution_id)
            .and_then(|e| e.incident_id)
    }

    async fn set_state(&self, execution_id: ExecutionId, state: EmergencyState) {
        if let Some(entry) = self.states.write().await.get_mut(&execution_id) {
            entry.state = state;
            entry.updated_at = Utc::now();
        }
    }

    /// 深刻度に対応するアクション（終了を先頭、アラートとバックアップを末尾に並べる）
    pub fn actions_for(&self, severity: Severity) -> Vec<EmergencyAction> {
        let configured = match severity {
            Severity::Critical => &self.config.critical_actions,
            Severity::High => &self.config.high_actions,
            Severity::Medium => &self.config.medium_actions,
            Severity::Low | Severity::Info => &self.config.low_actions,
        };

        let rank = |action: &EmergencyAction| match action {
            EmergencyAction::Terminate => 0,
            EmergencyAction::Alert | EmergencyAction::Backup => 2,
            _ => 1,
        };
        let mut actions: Vec<EmergencyAction> = Vec::with_capacity(configured.len());
        for action in configured {
            if !actions.contains(action) {
                actions.push(*action);
            }
        }
        actions.sort_by_key(rank);
        actions
    }

    fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.config.action_timeout_ms.max(1))
    }

    /// 付随アクションを時間制限つきで実行
    async fn bounded<F>(&self, action: EmergencyAction, future: F) -> ActionOutcome
    where
        F: Future<Output = ActionOutcome>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.action_timeout(), future).await {
            Ok(mut outcome) => {
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                outcome
            }
            Err(_) => ActionOutcome {
                action,
                success: false,
                message: format!("timed out after {} ms", self.config.action_timeout_ms),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    /// 実行単位・プラグイン単位のアクション
    async fn execute(
        &self,
        action: EmergencyAction,
        execution_id: ExecutionId,
        plugin_id: &str,
        reason: &str,
        incident_id: Option<Uuid>,
    ) -> ActionOutcome {
        let (success, message) = match action {
            EmergencyAction::Terminate => {
                if self
                    .executions
                    .terminate(execution_id, TerminationReason::Emergency)
                    .await
                {
                    (true, "execution terminated".to_string())
                } else {
                    (true, "execution already stopped".to_string())
                }
            }
            EmergencyAction::Suspend => {
                let applied = self.executions.suspend(execution_id).await;
                self.signal(action, execution_id, plugin_id, reason, applied)
            }
            EmergencyAction::Restrict => {
                let applied = self.executions.restrict(execution_id).await;
                self.signal(action, execution_id, plugin_id, reason, applied)
            }
            EmergencyAction::Isolate => {
                let applied = self.executions.isolate(execution_id).await;
                self.signal(action, execution_id, plugin_id, reason, applied)
            }
            EmergencyAction::Throttle => {
                let duration = Duration::from_millis(self.config.throttle_duration_ms);
                let applied = self.executions.throttle(execution_id, duration).await;
                self.signal(action, execution_id, plugin_id, reason, applied)
            }
            EmergencyAction::Monitor => self.signal(action, execution_id, plugin_id, reason, true),
            EmergencyAction::Quarantine => {
                match self.quarantine_plugin(plugin_id, reason, incident_id).await {
                    Ok(terminated) => {
                        self.events.emit(
                            SecurityEvent::new(
                                SecurityEventType::Quarantine,
                                Severity::Critical,
                                execution_id,
                                plugin_id,
                            )
                            .with_metadata("reason", reason)
                            .with_metadata("terminated", terminated.len()),
                        );
                        (
                            true,
                            format!("plugin quarantined; {} executions terminated", terminated.len()),
                        )
                    }
                    Err(e) => (false, format!("quarantine not persisted: {}", e)),
                }
            }
            EmergencyAction::ForensicCapture | EmergencyAction::Backup | EmergencyAction::Alert => {
                (false, "action requires an incident".to_string())
            }
        };

        ActionOutcome {
            action,
            success,
            message,
            duration_ms: 0,
        }
    }

    /// 実行制御シグナルをホストに通知
    fn signal(
        &self,
        action: EmergencyAction,
        execution_id: ExecutionId,
        plugin_id: &str,
        reason: &str,
        applied: bool,
    ) -> (bool, String) {
        if !applied {
            return (false, format!("{} not applied: execution not running", action));
        }
        self.events
            .notify(HostNotification::ExecutionSignal(ExecutionSignal {
                execution_id,
                plugin_id: plugin_id.to_string(),
                signal: action.as_str().to_string(),
                reason: reason.to_string(),
                issued_at: Utc::now(),
            }));
        (true, format!("{} signal issued", action))
    }

    /// プラグインを隔離し、実行中のものをすべて終了する
    pub async fn quarantine_plugin(
        &self,
        plugin_id: &str,
        reason: &str,
        incident_id: Option<Uuid>,
    ) -> Result<Vec<ExecutionId>> {
        let persisted = self
            .quarantine
            .write()
            .await
            .insert(QuarantineRecord {
                plugin_id: plugin_id.to_string(),
                reason: reason.to_string(),
                incident_id,
                quarantined_at: Utc::now(),
            })
            .await;

        let terminated = self
            .executions
            .terminate_plugin(plugin_id, TerminationReason::Quarantine)
            .await;
        {
            let mut states = self.states.write().await;
            for entry in states
                .values_mut()
                .filter(|e| e.plugin_id == plugin_id && e.state == EmergencyState::Active)
            {
                entry.state = EmergencyState::Quarantined;
                entry.updated_at = Utc::now();
            }
        }

        if !matches!(persisted, Ok(false)) {
            warn!(
                plugin_id,
                terminated = terminated.len(),
                "Plugin quarantined: {}",
                reason
            );
            self.events.notify(HostNotification::Quarantine {
                plugin_id: plugin_id.to_string(),
                reason: reason.to_string(),
            });
        }
        persisted?;
        Ok(terminated)
    }

    /// 隔離を解除する
    pub async fn release_quarantine(&self, plugin_id: &str) -> Result<bool> {
        let released = self.quarantine.write().await.release(plugin_id).await?;
        if released.is_some() {
            info!(plugin_id, "Quarantine released");
            self.events.notify(HostNotification::QuarantineReleased {
                plugin_id: plugin_id.to_string(),
            });
        }
        Ok(released.is_some())
    }

    pub async fn is_quarantined(&self, plugin_id: &str) -> bool {
        self.quarantine.read().await.is_quarantined(plugin_id)
    }

    pub async fn quarantine_record(&self, plugin_id: &str) -> Option<QuarantineRecord> {
        self.quarantine.read().await.get(plugin_id).cloned()
    }

    pub async fn list_quarantined(&self) -> Vec<QuarantineRecord> {
        self.quarantine.read().await.list()
    }

    /// 登録済みの提供元からフォレンジック情報を集める
    pub async fn capture_forensics(&self, execution_id: ExecutionId) -> Vec<ForensicArtifact> {
        let sources: Vec<Arc<dyn ForensicSource>> = {
            let mut sources = self.forensic_sources.write().await;
            sources.retain(|s| s.strong_count() > 0);
            sources.iter().filter_map(Weak::upgrade).collect()
        };

        let mut artifacts = Vec::with_capacity(sources.len());
        for source in sources {
            match tokio::time::timeout(self.action_timeout(), source.collect(execution_id)).await {
                Ok(Some(data)) => artifacts.push(ForensicArtifact {
                    source: source.name().to_string(),
                    collected_at: Utc::now(),
                    data,
                }),
                Ok(None) => {}
                Err(_) => warn!(%execution_id, source = source.name(), "Forensic collection timed out"),
            }
        }
        artifacts
    }

    /// ホスト側の状態スナップショット
    async fn state_snapshot(&self, plugin_id: &str) -> ForensicArtifact {
        let active: Vec<Value> = self
            .executions
            .active_executions()
            .await
            .into_iter()
            .filter(|e| e.plugin_id == plugin_id)
            .map(|e| json!(e))
            .collect();
        let storage = self
            .executions
            .plugin_state_snapshot(plugin_name(plugin_id))
            .await;
        ForensicArtifact {
            source: "host-snapshot".to_string(),
            collected_at: Utc::now(),
            data: json!({
                "plugin_id": plugin_id,
                "active_executions": active,
                "plugin_state": storage,
                "quarantined": self.is_quarantined(plugin_id).await,
            }),
        }
    }

    /// ホスト側スナップショットを `action_timeout` の範囲で取得して添付する
    async fn attach_snapshot(&self, incident: &mut EmergencyIncident) {
        match tokio::time::timeout(self.action_timeout(), self.state_snapshot(&incident.plugin_id)).await {
            Ok(snapshot) => incident.forensics.push(snapshot),
            Err(_) => warn!("Host state snapshot timed out"),
        }
    }

    async fn write_backup(&self, incident: &EmergencyIncident) -> Result<PathBuf> {
        let dir = self
            .config
            .backup_dir
            .as_ref()
            .ok_or_else(|| Error::Emergency("no backup directory configured".to_string()))?;
        let target = dir.join(format!("incident-{}", incident.id));
        tokio::fs::create_dir_all(&target).await?;

        write_atomic(&target.join("incident.json"), &serde_json::to_vec_pretty(incident)?).await?;
        let storage = self
            .executions
            .plugin_state_snapshot(plugin_name(&incident.plugin_id))
            .await
            .unwrap_or(Value::Null);
        write_atomic(&target.join("storage.json"), &serde_json::to_vec_pretty(&storage)?).await?;
        Ok(target)
    }

    pub async fn incident(&self, incident_id: Uuid) -> Option<EmergencyIncident> {
        self.incidents.get(incident_id).await
    }

    /// 直近のインシデント（新しい順）
    pub async fn incidents(&self, limit: usize) -> Vec<EmergencyIncident> {
        self.incidents.list(limit).await
    }

    pub async fn incidents_for_plugin(&self, plugin_id: &str) -> Vec<EmergencyIncident> {
        self.incidents.for_plugin(plugin_id).await
    }

    pub async fn incident_count(&self) -> u64 {
        self.incidents.count().await
    }

    /// 設定された保持期間でインシデントレコードを整理
    pub async fn apply_retention(&self) -> Result<usize> {
        self.incidents
            .apply_retention(self.config.incident_retention_days)
            .await
    }

    /// 終端状態の実行を一定時間後に忘れる
    pub async fn prune_states(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, e| e.state == EmergencyState::Active || e.updated_at >= cutoff);
        before - states.len()
    }
}

fn plugin_name(plugin_id: &str) -> &str {
    plugin_id
        .rsplit_once('@')
        .map_or(plugin_id, |(name, _)| name)
}

#[async_trait]
impl ThreatResponder for EmergencyController {
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id, trigger = %request.trigger))]
    async fn trigger_emergency(&self, request: EmergencyRequest) -> EmergencyResponse {
        let execution_id = request.execution_id;
        {
            let mut states = self.states.write().await;
            let entry = states
                .entry(execution_id)
                .or_insert_with(|| ExecutionEmergency::new(&request.plugin_id));
            if entry.state != EmergencyState::Active {
                debug!(state = ?entry.state, "Emergency already handled for execution");
                return EmergencyResponse::rejected(format!(
                    "execution {} is no longer active ({:?})",
                    execution_id, entry.state
                ));
            }
            entry.state = EmergencyState::IncidentTriggered;
            entry.updated_at = Utc::now();
        }

        error!(
            plugin_id = %request.plugin_id,
            severity = %request.severity,
            "Emergency triggered: {}",
            request.description
        );

        let mut incident = EmergencyIncident {
            id: Uuid::new_v4(),
            execution_id,
            plugin_id: request.plugin_id.clone(),
            trigger: request.trigger,
            severity: request.severity,
            description: request.description.clone(),
            created_at: Utc::now(),
            actions: Vec::new(),
            final_state: EmergencyState::ActionExecution,
            forensics: Vec::new(),
            backup_path: None,
        };

        self.set_state(execution_id, EmergencyState::ActionExecution).await;
        let reason = format!("{}: {}", request.trigger, request.description);

        // スナップショットは終了後、他の付随アクションより前に取る
        let mut snapshot_taken = false;
        for action in self.actions_for(request.severity) {
            if action != EmergencyAction::Terminate && !snapshot_taken {
                self.attach_snapshot(&mut incident).await;
                snapshot_taken = true;
            }
            let outcome = match action {
                EmergencyAction::Terminate => {
                    let started = Instant::now();
                    let mut outcome = self
                        .execute(action, execution_id, &request.plugin_id, &reason, Some(incident.id))
                        .await;
                    outcome.duration_ms = started.elapsed().as_millis() as u64;
                    outcome
                }
                EmergencyAction::ForensicCapture => {
                    if self.config.forensic_capture {
                        let started = Instant::now();
                        let artifacts = self.capture_forensics(execution_id).await;
                        let count = artifacts.len();
                        incident.forensics.extend(artifacts);
                        ActionOutcome {
                            action,
                            success: true,
                            message: format!("{} artifacts collected", count),
                            duration_ms: started.elapsed().as_millis() as u64,
                        }
                    } else {
                        ActionOutcome {
                            action,
                            success: false,
                            message: "forensic capture disabled".to_string(),
                            duration_ms: 0,
                        }
                    }
                }
                EmergencyAction::Alert => {
                    let alerts = self.alerts.clone();
                    let snapshot = incident.clone();
                    self.bounded(action, async move {
                        let (success, message) = match alerts.send(&snapshot).await {
                            Ok(()) => (true, "alert sent".to_string()),
                            Err(e) => (false, format!("alert delivery failed: {}", e)),
                        };
                        ActionOutcome { action, success, message, duration_ms: 0 }
                    })
                    .await
                }
                EmergencyAction::Backup => {
                    let mut backup_path = None;
                    let outcome = self
                        .bounded(action, async {
                            let (success, message) = match self.write_backup(&incident).await {
                                Ok(path) => {
                                    let message = format!("backup written to {}", path.display());
                                    backup_path = Some(path);
                                    (true, message)
                                }
                                Err(e) => (false, format!("backup failed: {}", e)),
                            };
                            ActionOutcome { action, success, message, duration_ms: 0 }
                        })
                        .await;
                    incident.backup_path = backup_path;
                    outcome
                }
                other => {
                    self.bounded(
                        other,
                        self.execute(other, execution_id, &request.plugin_id, &reason, Some(incident.id)),
                    )
                    .await
                }
            };

            if outcome.success {
                debug!(action = %outcome.action, "{}", outcome.message);
            } else {
                warn!(action = %outcome.action, "Emergency action failed: {}", outcome.message);
            }
            incident.actions.push(outcome);
        }
        if !snapshot_taken {
            self.attach_snapshot(&mut incident).await;
        }

        let quarantined = incident
            .actions
            .iter()
            .any(|a| a.action == EmergencyAction::Quarantine && a.success);
        incident.final_state = if quarantined {
            EmergencyState::Quarantined
        } else {
            EmergencyState::Resolved
        };
        {
            let mut states = self.states.write().await;
            if let Some(entry) = states.get_mut(&execution_id) {
                entry.state = incident.final_state;
                entry.incident_id = Some(incident.id);
                entry.updated_at = Utc::now();
            }
        }

        if let Err(e) = self.incidents.record(incident.clone()).await {
            error!(incident_id = %incident.id, "Failed to persist incident: {}", e);
        }

        self.events.emit(
            SecurityEvent::new(
                SecurityEventType::Emergency,
                request.severity,
                execution_id,
                request.plugin_id.clone(),
            )
            .with_metadata("incident_id", incident.id.to_string())
            .with_metadata("trigger", request.trigger.as_str()),
        );
        self.events
            .notify(HostNotification::Emergency(incident.summary()));

        info!(
            incident_id = %incident.id,
            final_state = ?incident.final_state,
            "Incident recorded"
        );
        EmergencyResponse {
            success: true,
            incident_id: Some(incident.id),
            message: format!(
                "incident {} recorded with {} actions",
                incident.id,
                incident.actions.len()
            ),
            actions: incident.actions,
        }
    }

    async fn dispatch_action(
        &self,
        execution_id: ExecutionId,
        plugin_id: &str,
        action: EmergencyAction,
        reason: &str,
    ) -> ActionOutcome {
        info!(%execution_id, %action, "Dispatching emergency action: {}", reason);
        if action == EmergencyAction::Terminate {
            let started = Instant::now();
            let mut outcome = self
                .execute(action, execution_id, plugin_id, reason, None)
                .await;
            outcome.duration_ms = started.elapsed().as_millis() as u64;
            return outcome;
        }
        self.bounded(
            action,
            self.execute(action, execution_id, plugin_id, reason, None),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::types::EmergencyTrigger;
    use crate::events::{EventBus, NullSink};
    use crate::sandbox::ActiveExecution;
    use std::sync::Mutex;

    /// 呼び出しを記録するだけの実行制御
    #[derive(Default)]
    struct RecordingController {
        running: Mutex<Vec<(ExecutionId, String)>>,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingController {
        fn start(&self, execution_id: ExecutionId, plugin_id: &str) {
            self.running
                .lock()
                .unwrap()
                .push((execution_id, plugin_id.to_string()));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn call(&self, name: &str) {
            self.calls.lock().unwrap().push(name.to_string());
        }

        fn is_running(&self, execution_id: ExecutionId) -> bool {
            self.running
                .lock()
                .unwrap()
                .iter()
                .any(|(id, _)| *id == execution_id)
        }
    }

    #[async_trait]
    impl ExecutionController for RecordingController {
        async fn terminate(&self, execution_id: ExecutionId, _reason: TerminationReason) -> bool {
            self.call("terminate");
            let mut running = self.running.lock().unwrap();
            let before = running.len();
            running.retain(|(id, _)| *id != execution_id);
            running.len() != before
        }

        async fn terminate_plugin(
            &self,
            plugin_id: &str,
            _reason: TerminationReason,
        ) -> Vec<ExecutionId> {
            self.call("terminate_plugin");
            let mut running = self.running.lock().unwrap();
            let (stopped, kept): (Vec<_>, Vec<_>) =
                running.drain(..).partition(|(_, p)| p == plugin_id);
            *running = kept;
            stopped.into_iter().map(|(id, _)| id).collect()
        }

        async fn suspend(&self, execution_id: ExecutionId) -> bool {
            self.call("suspend");
            self.is_running(execution_id)
        }

        async fn resume(&self, execution_id: ExecutionId) -> bool {
            self.is_running(execution_id)
        }

        async fn restrict(&self, execution_id: ExecutionId) -> bool {
            self.call("restrict");
            self.is_running(execution_id)
        }

        async fn isolate(&self, execution_id: ExecutionId) -> bool {
            self.call("isolate");
            self.is_running(execution_id)
        }

        async fn throttle(&self, execution_id: ExecutionId, _duration: Duration) -> bool {
            self.call("throttle");
            self.is_running(execution_id)
        }

        async fn is_active(&self, execution_id: ExecutionId) -> bool {
            self.is_running(execution_id)
        }

        async fn active_executions(&self) -> Vec<ActiveExecution> {
            self.call("snapshot");
            Vec::new()
        }

        async fn plugin_state_snapshot(&self, plugin_name: &str) -> Option<Value> {
            Some(json!({ "plugin": plugin_name, "entries": {"k": "v"} }))
        }
    }

    struct FailingAlerts;

    #[async_trait]
    impl AlertSink for FailingAlerts {
        async fn send(&self, _incident: &EmergencyIncident) -> std::result::Result<(), String> {
            Err("webhook unreachable".to_string())
        }
    }

    struct SlowAlerts;

    #[async_trait]
    impl AlertSink for SlowAlerts {
        async fn send(&self, _incident: &EmergencyIncident) -> std::result::Result<(), String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    struct StaticSource;

    #[async_trait]
    impl ForensicSource for StaticSource {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn collect(&self, execution_id: ExecutionId) -> Option<Value> {
            Some(json!({ "execution_id": execution_id }))
        }
    }

    fn request(execution_id: ExecutionId, severity: Severity) -> EmergencyRequest {
        EmergencyRequest {
            execution_id,
            plugin_id: "p@1.0.0".to_string(),
            trigger: EmergencyTrigger::InfiniteLoop,
            severity,
            description: "execution exceeded its time budget".to_string(),
        }
    }

    async fn setup(config: EmergencyConfig) -> (EmergencyController, Arc<RecordingController>) {
        let executions = Arc::new(RecordingController::default());
        let controller = EmergencyController::open(config, executions.clone(), Arc::new(NullSink))
            .await
            .unwrap();
        (controller, executions)
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent_per_execution() {
        let (controller, executions) = setup(EmergencyConfig::default()).await;
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");
        controller.register_execution(id, "p@1.0.0").await;

        let first = controller.trigger_emergency(request(id, Severity::Critical)).await;
        assert!(first.success);
        assert!(first.incident_id.is_some());
        // 終了が最初に実行される
        assert_eq!(first.actions[0].action, EmergencyAction::Terminate);

        let second = controller.trigger_emergency(request(id, Severity::Critical)).await;
        assert!(!second.success);
        assert!(second.incident_id.is_none());
        assert_eq!(controller.incident_count().await, 1);
        assert_eq!(controller.state(id).await, Some(EmergencyState::Quarantined));
        assert!(controller.is_quarantined("p@1.0.0").await);
    }

    #[tokio::test]
    async fn test_completed_execution_cannot_trigger() {
        let (controller, _) = setup(EmergencyConfig::default()).await;
        let id = Uuid::new_v4();
        controller.register_execution(id, "p@1.0.0").await;
        assert!(controller.complete_execution(id).await);

        let response = controller.trigger_emergency(request(id, Severity::High)).await;
        assert!(!response.success);
        assert_eq!(controller.incident_count().await, 0);
    }

    #[tokio::test]
    async fn test_terminate_precedes_configured_order() {
        let config = EmergencyConfig {
            high_actions: vec![
                EmergencyAction::Alert,
                EmergencyAction::Restrict,
                EmergencyAction::Terminate,
            ],
            ..Default::default()
        };
        let (controller, executions) = setup(config).await;
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");

        let response = controller.trigger_emergency(request(id, Severity::High)).await;
        let order: Vec<EmergencyAction> = response.actions.iter().map(|a| a.action).collect();
        assert_eq!(
            order,
            vec![
                EmergencyAction::Terminate,
                EmergencyAction::Restrict,
                EmergencyAction::Alert
            ]
        );
        assert_eq!(executions.calls()[0], "terminate");
    }

    #[tokio::test]
    async fn test_failed_side_actions_do_not_block_termination() {
        let config = EmergencyConfig {
            action_timeout_ms: 50,
            ..Default::default()
        };
        let (controller, executions) = setup(config.clone()).await;
        let controller = controller.with_alert_sink(Arc::new(SlowAlerts));
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");

        let response = controller.trigger_emergency(request(id, Severity::High)).await;
        assert!(response.success);
        assert!(!executions.is_running(id));
        let alert = response
            .actions
            .iter()
            .find(|a| a.action == EmergencyAction::Alert)
            .unwrap();
        assert!(!alert.success);
        assert!(alert.message.contains("timed out"));

        let (controller, executions) = controller_with_failing_alerts(config).await;
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");
        let response = controller.trigger_emergency(request(id, Severity::High)).await;
        assert!(response.success);
        assert!(controller.incident(response.incident_id.unwrap()).await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_taken_after_terminate() {
        let (controller, executions) = setup(EmergencyConfig::default()).await;
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");

        let response = controller.trigger_emergency(request(id, Severity::Critical)).await;
        assert!(response.success);
        let calls = executions.calls();
        let terminate = calls.iter().position(|c| c == "terminate").unwrap();
        let snapshot = calls.iter().position(|c| c == "snapshot").unwrap();
        assert!(terminate < snapshot, "calls: {:?}", calls);

        let incident = controller.incident(response.incident_id.unwrap()).await.unwrap();
        assert!(incident.forensics.iter().any(|f| f.source == "host-snapshot"));

        // 終了のみの構成でもスナップショットは添付される
        let config = EmergencyConfig {
            low_actions: vec![EmergencyAction::Terminate],
            ..Default::default()
        };
        let (controller, executions) = setup(config).await;
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");
        let response = controller.trigger_emergency(request(id, Severity::Low)).await;
        assert_eq!(executions.calls(), ["terminate", "snapshot"]);
        let incident = controller.incident(response.incident_id.unwrap()).await.unwrap();
        assert_eq!(incident.forensics.len(), 1);
    }

    async fn controller_with_failing_alerts(
        config: EmergencyConfig,
    ) -> (EmergencyController, Arc<RecordingController>) {
        let (controller, executions) = setup(config).await;
        (controller.with_alert_sink(Arc::new(FailingAlerts)), executions)
    }

    #[tokio::test]
    async fn test_quarantine_terminates_all_plugin_executions() {
        let bus = EventBus::new(16);
        let mut notifications = bus.subscribe();
        let executions = Arc::new(RecordingController::default());
        let controller =
            EmergencyController::open(EmergencyConfig::default(), executions.clone(), Arc::new(bus))
                .await
                .unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let other = Uuid::new_v4();
        executions.start(a, "p@1.0.0");
        executions.start(b, "p@1.0.0");
        executions.start(other, "q@1.0.0");

        let terminated = controller
            .quarantine_plugin("p@1.0.0", "manual hold", None)
            .await
            .unwrap();
        assert_eq!(terminated.len(), 2);
        assert!(executions.is_running(other));
        assert!(matches!(
            notifications.recv().await.unwrap(),
            HostNotification::Quarantine { .. }
        ));

        assert_eq!(controller.list_quarantined().await.len(), 1);
        assert!(controller.release_quarantine("p@1.0.0").await.unwrap());
        assert!(!controller.is_quarantined("p@1.0.0").await);
        assert!(matches!(
            notifications.recv().await.unwrap(),
            HostNotification::QuarantineReleased { .. }
        ));
    }

    #[tokio::test]
    async fn test_forensics_and_backup_attached_to_incident() {
        let dir = tempfile::tempdir().unwrap();
        let config = EmergencyConfig {
            critical_actions: vec![
                EmergencyAction::Terminate,
                EmergencyAction::ForensicCapture,
                EmergencyAction::Backup,
            ],
            incident_dir: Some(dir.path().join("incidents")),
            backup_dir: Some(dir.path().join("backups")),
            ..Default::default()
        };
        let (controller, executions) = setup(config).await;
        let source: Arc<dyn ForensicSource> = Arc::new(StaticSource);
        controller.register_forensic_source(&source).await;
        {
            // 解放済みの提供元は無視される
            let dropped: Arc<dyn ForensicSource> = Arc::new(StaticSource);
            controller.register_forensic_source(&dropped).await;
        }

        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");
        let response = controller.trigger_emergency(request(id, Severity::Critical)).await;
        let incident = controller.incident(response.incident_id.unwrap()).await.unwrap();

        let sources: Vec<&str> = incident.forensics.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(sources, vec!["host-snapshot", "static"]);

        let backup = incident.backup_path.clone().unwrap();
        assert!(backup.join("incident.json").exists());
        assert!(backup.join("storage.json").exists());
        assert!(dir.path().join("incidents").join("incidents.log").exists());
    }

    #[tokio::test]
    async fn test_dispatch_restrict_without_incident() {
        let (controller, executions) = setup(EmergencyConfig::default()).await;
        let id = Uuid::new_v4();
        executions.start(id, "p@1.0.0");

        let outcome = controller
            .dispatch_action(id, "p@1.0.0", EmergencyAction::Restrict, "probing")
            .await;
        assert!(outcome.success);
        assert_eq!(controller.incident_count().await, 0);

        let alert = controller
            .dispatch_action(id, "p@1.0.0", EmergencyAction::Alert, "probing")
            .await;
        assert!(!alert.success);
    }
}
