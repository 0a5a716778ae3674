//! Sandbox Executor
//!
//! 隔離コンテキストを起動し、結果・強制終了・期限・仲介API呼び出しを待ち合わせる。

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::capabilities::{CapabilityBroker, CapabilityCall, CapabilityError};
use super::context::{dry_run, DryRunReport, IsolatedContext};
use super::handle::{ActiveExecution, ExecutionController, ExecutionHandle, TerminationReason};
use super::limits::ExecutionLimits;
use super::protocol::{
    ExecutionError, ExecutionErrorKind, ExecutionResult, SandboxRequest, SandboxResponse,
};
use crate::config::SandboxConfig;
use crate::events::{EventSink, SecurityEvent, SecurityEventType};
use crate::plugin::Plugin;
use crate::resource::{ExecutionUsageSnapshot, UsageSampler};
use crate::types::{ExecutionId, SandboxLevel, Severity};

/// サンドボックス実行エンジン
pub struct SandboxExecutor {
    config: SandboxConfig,
    broker: Arc<CapabilityBroker>,
    events: Arc<dyn EventSink>,
    executions: Arc<RwLock<HashMap<ExecutionId, Arc<ExecutionHandle>>>>,
}

impl SandboxExecutor {
    pub fn new(
        config: SandboxConfig,
        broker: Arc<CapabilityBroker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            broker,
            events,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// サンドボックスレベルに応じた既定の上限
    pub fn limits_for(&self, level: SandboxLevel) -> ExecutionLimits {
        ExecutionLimits::from_config(&self.config, level)
    }

    /// エントリポイントを実行（常に結果を返す）
    pub async fn run(
        &self,
        plugin: &Plugin,
        entry_point: &str,
        args: Vec<Value>,
        limits: ExecutionLimits,
    ) -> ExecutionResult {
        self.run_with_id(Uuid::new_v4(), plugin, entry_point, args, limits)
            .await
    }

    /// 実行IDを指定して実行（監視を先に登録したい呼び出し元向け）
    #[instrument(skip(self, plugin, args, limits), fields(plugin = %plugin.id()))]
    pub async fn run_with_id(
        &self,
        execution_id: ExecutionId,
        plugin: &Plugin,
        entry_point: &str,
        args: Vec<Value>,
        limits: ExecutionLimits,
    ) -> ExecutionResult {
        let handle = Arc::new(ExecutionHandle::new(
            execution_id,
            plugin.id(),
            plugin.name(),
            entry_point,
            Duration::from_millis(limits.max_execution_time_ms),
        ));
        self.executions
            .write()
            .await
            .insert(execution_id, handle.clone());

        info!(%execution_id, entry_point, "Starting sandboxed execution");
        self.events.emit(
            SecurityEvent::new(
                SecurityEventType::ExecutionStarted,
                Severity::Info,
                execution_id,
                plugin.id(),
            )
            .with_metadata("entry_point", entry_point),
        );

        let outcome = self
            .drive(&handle, plugin, entry_point, args, &limits)
            .await;

        handle.mark_finished();
        handle.release_context();
        self.executions.write().await.remove(&execution_id);

        let result = ExecutionResult {
            execution_id,
            plugin_id: plugin.id(),
            entry_point: entry_point.to_string(),
            success: outcome.is_ok(),
            value: outcome.as_ref().ok().cloned(),
            error: outcome.err(),
            stats: handle.stats(),
            started_at: handle.started_at,
            finished_at: Utc::now(),
        };

        self.report(&result);
        result
    }

    async fn drive(
        &self,
        handle: &Arc<ExecutionHandle>,
        plugin: &Plugin,
        entry_point: &str,
        args: Vec<Value>,
        limits: &ExecutionLimits,
    ) -> Result<Value, ExecutionError> {
        let (call_tx, mut call_rx) = mpsc::unbounded_channel::<CapabilityCall>();
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<SandboxResponse>();

        let mut context = IsolatedContext::spawn(
            handle.clone(),
            plugin.clone(),
            limits.clone(),
            call_tx,
            response_tx,
        )
        .map_err(|e| {
            ExecutionError::new(
                ExecutionErrorKind::Internal,
                format!("failed to start isolated context: {}", e),
            )
        })?;

        let invoke = SandboxRequest::Invoke {
            entry_point: entry_point.to_string(),
            args,
        };
        if !context.send(invoke) {
            return Err(ExecutionError::new(
                ExecutionErrorKind::Internal,
                "isolated context rejected the request",
            ));
        }

        let deadline =
            TokioInstant::now() + Duration::from_millis(limits.max_execution_time_ms);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = handle.terminated() => {
                    break Err(termination_error(handle, limits));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.terminate(TerminationReason::Timeout);
                    break Err(termination_error(handle, limits));
                }
                response = response_rx.recv() => {
                    break match response {
                        Some(SandboxResponse::Completed { value, .. }) => Ok(value),
                        Some(SandboxResponse::Faulted { error, .. }) => Err(error),
                        None => Err(ExecutionError::new(
                            ExecutionErrorKind::Internal,
                            "isolated context exited without a response",
                        )),
                    };
                }
                Some(call) = call_rx.recv() => {
                    self.serve(handle, limits, call, deadline).await;
                }
            }
        };

        context.shutdown();
        // 未処理の呼び出しは応答側を落として隔離スレッドを解放する
        call_rx.close();
        outcome
    }

    /// 仲介API呼び出しを1件処理（終了要求と期限を優先）
    async fn serve(
        &self,
        handle: &ExecutionHandle,
        limits: &ExecutionLimits,
        call: CapabilityCall,
        deadline: TokioInstant,
    ) {
        let CapabilityCall { request, reply } = call;
        let operation = request.operation();
        let timeout = Duration::from_millis(self.config.capability_timeout_ms);

        let result = tokio::select! {
            biased;
            _ = handle.terminated() => Err(CapabilityError::Terminated),
            _ = tokio::time::sleep_until(deadline) => Err(CapabilityError::Terminated),
            outcome = tokio::time::timeout(timeout, self.broker.handle(handle, limits, request)) => {
                outcome.unwrap_or_else(|_| {
                    warn!(execution_id = %handle.execution_id, "Capability {} timed out", operation);
                    Err(CapabilityError::Failed(format!("{} timed out", operation)))
                })
            }
        };

        if reply.send(result).is_err() {
            debug!(execution_id = %handle.execution_id, "Isolated context no longer waiting for {}", operation);
        }
    }

    fn report(&self, result: &ExecutionResult) {
        let (event_type, severity) = match result.error_kind() {
            None => (SecurityEventType::ExecutionCompleted, Severity::Info),
            Some(ExecutionErrorKind::Timeout) => (SecurityEventType::Timeout, Severity::High),
            Some(kind) if kind.is_runaway() => (SecurityEventType::ExecutionFailed, Severity::High),
            Some(ExecutionErrorKind::MemoryLimit) | Some(ExecutionErrorKind::ResourceLimit) => {
                (SecurityEventType::ResourceViolation, Severity::High)
            }
            Some(_) => (SecurityEventType::ExecutionFailed, Severity::Medium),
        };

        let mut event = SecurityEvent::new(
            event_type,
            severity,
            result.execution_id,
            result.plugin_id.clone(),
        )
        .with_metadata("entry_point", result.entry_point.clone())
        .with_metadata("duration_ms", result.stats.duration_ms)
        .with_metadata("operations", result.stats.operations);
        if let Some(error) = &result.error {
            event = event
                .with_metadata("error_kind", error.kind.as_str())
                .with_metadata("error", error.message.clone());
            warn!(
                execution_id = %result.execution_id,
                "Sandboxed execution failed: {}",
                error
            );
        } else {
            info!(
                execution_id = %result.execution_id,
                duration_ms = result.stats.duration_ms,
                "Sandboxed execution completed"
            );
        }
        self.events.emit(event);
    }

    /// コンパイルのみ行う
    pub fn dry_run(&self, plugin: &Plugin, level: SandboxLevel) -> DryRunReport {
        dry_run(plugin, &self.limits_for(level))
    }

    /// 実行中の件数
    pub async fn active_count(&self) -> usize {
        self.executions.read().await.len()
    }

    async fn get(&self, execution_id: ExecutionId) -> Option<Arc<ExecutionHandle>> {
        self.executions.read().await.get(&execution_id).cloned()
    }
}

fn termination_error(handle: &ExecutionHandle, limits: &ExecutionLimits) -> ExecutionError {
    let reason = handle
        .termination_reason()
        .unwrap_or(TerminationReason::Cancelled);
    let message = match reason {
        TerminationReason::Timeout => format!(
            "execution timeout: exceeded {} ms",
            limits.max_execution_time_ms
        ),
        TerminationReason::MemoryLimit => format!(
            "memory limit of {} bytes exceeded",
            limits.max_memory_bytes
        ),
        other => format!("execution terminated: {}", other.as_str()),
    };
    ExecutionError::new(reason.error_kind(), message)
}

#[async_trait]
impl ExecutionController for SandboxExecutor {
    async fn terminate(&self, execution_id: ExecutionId, reason: TerminationReason) -> bool {
        match self.get(execution_id).await {
            Some(handle) => {
                let terminated = handle.terminate(reason);
                if terminated {
                    warn!(%execution_id, reason = reason.as_str(), "Execution terminated");
                }
                terminated
            }
            None => false,
        }
    }

    async fn terminate_plugin(
        &self,
        plugin_id: &str,
        reason: TerminationReason,
    ) -> Vec<ExecutionId> {
        let handles: Vec<Arc<ExecutionHandle>> = self
            .executions
            .read()
            .await
            .values()
            .filter(|h| h.plugin_id == plugin_id)
            .cloned()
            .collect();

        handles
            .into_iter()
            .filter(|h| h.terminate(reason))
            .map(|h| h.execution_id)
            .collect()
    }

    async fn suspend(&self, execution_id: ExecutionId) -> bool {
        match self.get(execution_id).await {
            Some(handle) => handle.set_suspended(true),
            None => false,
        }
    }

    async fn resume(&self, execution_id: ExecutionId) -> bool {
        match self.get(execution_id).await {
            Some(handle) => handle.set_suspended(false),
            None => false,
        }
    }

    async fn restrict(&self, execution_id: ExecutionId) -> bool {
        match self.get(execution_id).await {
            Some(handle) => handle.set_restricted(),
            None => false,
        }
    }

    async fn isolate(&self, execution_id: ExecutionId) -> bool {
        match self.get(execution_id).await {
            Some(handle) => handle.set_isolated(),
            None => false,
        }
    }

    async fn throttle(&self, execution_id: ExecutionId, duration: Duration) -> bool {
        match self.get(execution_id).await {
            Some(handle) => {
                handle.throttle_for(duration);
                true
            }
            None => false,
        }
    }

    async fn is_active(&self, execution_id: ExecutionId) -> bool {
        self.get(execution_id)
            .await
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn active_executions(&self) -> Vec<ActiveExecution> {
        self.executions
            .read()
            .await
            .values()
            .map(|handle| handle.summary())
            .collect()
    }

    async fn plugin_state_snapshot(&self, plugin_name: &str) -> Option<Value> {
        self.broker.storage_snapshot(plugin_name).await
    }
}

#[async_trait]
impl UsageSampler for SandboxExecutor {
    async fn sample(&self, execution_id: ExecutionId) -> Option<ExecutionUsageSnapshot> {
        self.get(execution_id)
            .await
            .filter(|handle| !handle.is_finished())
            .map(|handle| handle.usage_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::plugin::PluginManifest;
    use crate::sandbox::capabilities::{AuthorizationDecision, CapabilityAuthorizer};
    use serde_json::json;

    struct AllowAll;

    #[async_trait]
    impl CapabilityAuthorizer for AllowAll {
        async fn authorize(
            &self,
            _plugin_id: &str,
            _permission: &str,
            _resource: Option<&str>,
            _context: &HashMap<String, Value>,
        ) -> AuthorizationDecision {
            AuthorizationDecision {
                granted: true,
                reason: "test".to_string(),
            }
        }
    }

    fn executor(root: &std::path::Path) -> Arc<SandboxExecutor> {
        let config = SandboxConfig {
            fs_root: root.to_path_buf(),
            ..Default::default()
        };
        let broker = Arc::new(CapabilityBroker::new(
            config.clone(),
            Arc::new(AllowAll),
            Arc::new(NullSink),
        ));
        Arc::new(SandboxExecutor::new(config, broker, Arc::new(NullSink)))
    }

    fn plugin(source: &str) -> Plugin {
        let manifest = PluginManifest::from_json(
            &json!({
                "name": "demo",
                "version": "1.0.0",
                "description": "demo plugin",
                "entryPoints": ["run", "spin", "recurse", "boom", "save"],
            })
            .to_string(),
        )
        .unwrap();
        Plugin::new(manifest, source).unwrap()
    }

    #[tokio::test]
    async fn test_successful_execution_returns_value() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin("fn run(a, b) { #{ sum: a + b } }");

        let result = executor
            .run(&plugin, "run", vec![json!(2), json!(3)], ExecutionLimits::default())
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, Some(json!({"sum": 5})));
        assert!(result.stats.operations > 0);
        assert!(result.stats.function_calls.is_none());
        assert_eq!(executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin("fn spin() { loop { } }");
        let limits = ExecutionLimits {
            max_operations: 0,
            ..Default::default()
        }
        .with_timeout_ms(200);

        let result = executor.run(&plugin, "spin", vec![], limits).await;
        assert!(!result.success);
        assert!(result.is_timeout());
        assert!(result.error.unwrap().message.contains("timeout"));
    }

    #[tokio::test]
    async fn test_runaway_recursion_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin("fn recurse(n) { recurse(n + 1) }");

        let result = executor
            .run(&plugin, "recurse", vec![json!(0)], ExecutionLimits::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ExecutionErrorKind::StackOverflow));
    }

    #[tokio::test]
    async fn test_runtime_fault_becomes_result() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin(r#"fn boom() { throw "kaboom"; }"#);

        let result = executor
            .run(&plugin, "boom", vec![], ExecutionLimits::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Runtime));
    }

    #[tokio::test]
    async fn test_undeclared_entry_point_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin("fn run() { 1 } fn secret() { 2 }");

        let result = executor
            .run(&plugin, "secret", vec![], ExecutionLimits::default())
            .await;
        assert_eq!(
            result.error_kind(),
            Some(ExecutionErrorKind::UnknownEntryPoint)
        );
    }

    #[tokio::test]
    async fn test_capabilities_are_mediated() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin(
            r#"
            fn save(v) {
                storage_set("last", v);
                fs_write_file("out.txt", "saved");
                print("saved " + v);
                storage_get("last")
            }
            "#,
        );

        let result = executor
            .run(&plugin, "save", vec![json!("x")], ExecutionLimits::default())
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.value, Some(json!("x")));
        assert!(result.stats.capability_calls >= 4);
        assert!(dir.path().join("demo/data/out.txt").exists());

        let snapshot = executor.plugin_state_snapshot("demo").await.unwrap();
        assert_eq!(snapshot["last"], json!("x"));
    }

    #[tokio::test]
    async fn test_external_termination_yields_result() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let plugin = plugin("fn spin() { loop { } }");
        let id = Uuid::new_v4();
        let limits = ExecutionLimits {
            max_operations: 0,
            ..Default::default()
        }
        .with_timeout_ms(10_000);

        let runner = {
            let executor = executor.clone();
            let plugin = plugin.clone();
            tokio::spawn(async move { executor.run_with_id(id, &plugin, "spin", vec![], limits).await })
        };

        // 実行が登録されるまで待つ
        for _ in 0..100 {
            if executor.is_active(id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(executor.terminate(id, TerminationReason::Emergency).await);
        // 二回目は無効
        assert!(!executor.terminate(id, TerminationReason::Emergency).await);

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Terminated));
    }
}
