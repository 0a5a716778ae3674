//! Responder and Forensic Interfaces

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use super::types::{
    ActionOutcome, EmergencyAction, EmergencyIncident, EmergencyRequest, EmergencyResponse,
};
use crate::types::{ExecutionId, Severity};

/// 緊急対応の受け口
///
/// リソース監視と振る舞い監視はこのトレイト経由で緊急対応を要求する。
#[async_trait]
pub trait ThreatResponder: Send + Sync {
    /// インシデントを起こし、深刻度に応じたアクションを実行する
    async fn trigger_emergency(&self, request: EmergencyRequest) -> EmergencyResponse;

    /// 単一のアクションを実行する（インシデントは作らない）
    async fn dispatch_action(
        &self,
        execution_id: ExecutionId,
        plugin_id: &str,
        action: EmergencyAction,
        reason: &str,
    ) -> ActionOutcome;
}

/// フォレンジック情報の提供元
#[async_trait]
pub trait ForensicSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn collect(&self, execution_id: ExecutionId) -> Option<Value>;
}

/// アラートの送信先
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, incident: &EmergencyIncident) -> Result<(), String>;
}

/// ログに出すだけのアラート
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, incident: &EmergencyIncident) -> Result<(), String> {
        match incident.severity {
            Severity::Critical | Severity::High => error!(
                target: "security_alert",
                incident_id = %incident.id,
                plugin_id = %incident.plugin_id,
                trigger = %incident.trigger,
                severity = %incident.severity,
                "{}",
                incident.description
            ),
            _ => warn!(
                target: "security_alert",
                incident_id = %incident.id,
                plugin_id = %incident.plugin_id,
                trigger = %incident.trigger,
                severity = %incident.severity,
                "{}",
                incident.description
            ),
        }
        Ok(())
    }
}
