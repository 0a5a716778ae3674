//! Security Event Stream
//!
//! 実行ごとのセキュリティイベントと、ホストへ通知するイベントバス

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::behavior::ThreatAssessment;
use crate::emergency::IncidentSummary;
use crate::permission::AuditEntry;
use crate::resource::ResourceViolation;
use crate::types::{ExecutionId, Severity};

/// セキュリティイベントタイプ
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityEventType {
    /// ファイルアクセス
    FileAccess,
    /// ネットワークリクエスト
    NetworkRequest,
    /// プロセス起動の試み
    ProcessSpawn,
    /// ストレージアクセス
    StorageAccess,
    /// ログ出力
    Log,
    /// 仲介APIによる拒否
    CapabilityDenied,
    /// 権限チェックによる拒否
    PermissionDenied,
    /// リソース違反
    ResourceViolation,
    /// 不審な振る舞い
    SuspiciousBehavior,
    /// 実行開始
    ExecutionStarted,
    /// 実行完了
    ExecutionCompleted,
    /// 実行失敗
    ExecutionFailed,
    /// タイムアウト
    Timeout,
    /// 脅威検知
    ThreatDetected,
    /// 緊急対応
    Emergency,
    /// 隔離
    Quarantine,
    /// カスタム
    Custom(String),
}

impl SecurityEventType {
    /// 文字列表現
    pub fn as_str(&self) -> &str {
        match self {
            SecurityEventType::FileAccess => "file-access",
            SecurityEventType::NetworkRequest => "network-request",
            SecurityEventType::ProcessSpawn => "process-spawn",
            SecurityEventType::StorageAccess => "storage-access",
            SecurityEventType::Log => "log",
            SecurityEventType::CapabilityDenied => "capability-denied",
            SecurityEventType::PermissionDenied => "permission-denied",
            SecurityEventType::ResourceViolation => "resource-violation",
            SecurityEventType::SuspiciousBehavior => "suspicious-behavior",
            SecurityEventType::ExecutionStarted => "execution-started",
            SecurityEventType::ExecutionCompleted => "execution-completed",
            SecurityEventType::ExecutionFailed => "execution-failed",
            SecurityEventType::Timeout => "timeout",
            SecurityEventType::ThreatDetected => "threat-detected",
            SecurityEventType::Emergency => "emergency",
            SecurityEventType::Quarantine => "quarantine",
            SecurityEventType::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// セキュリティイベント
///
/// 生成後は変更しない。実行ごとに追記のみ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// イベントID
    pub id: Uuid,
    /// 発生時刻
    pub timestamp: DateTime<Utc>,
    /// イベントタイプ
    pub event_type: SecurityEventType,
    /// 深刻度
    pub severity: Severity,
    /// 実行ID
    pub execution_id: ExecutionId,
    /// プラグインID（name@version）
    pub plugin_id: String,
    /// メタデータ
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SecurityEvent {
    /// 新しいイベントを作成
    pub fn new(
        event_type: SecurityEventType,
        severity: Severity,
        execution_id: ExecutionId,
        plugin_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            execution_id,
            plugin_id: plugin_id.into(),
            metadata: HashMap::new(),
        }
    }

    /// メタデータを追加
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// タイムスタンプを指定（再生・テスト用）
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// 実行制御シグナル（restrict / suspend / isolate / monitor）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSignal {
    /// 実行ID
    pub execution_id: ExecutionId,
    /// プラグインID
    pub plugin_id: String,
    /// シグナル名
    pub signal: String,
    /// 理由
    pub reason: String,
    /// 発行時刻
    pub issued_at: DateTime<Utc>,
}

/// ホストへの通知
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum HostNotification {
    /// セキュリティイベント
    SecurityEvent(SecurityEvent),
    /// 脅威評価
    ThreatAssessment(ThreatAssessment),
    /// リソース違反
    ResourceViolation(ResourceViolation),
    /// 緊急対応
    Emergency(IncidentSummary),
    /// 隔離
    Quarantine {
        /// プラグインID
        plugin_id: String,
        /// 理由
        reason: String,
    },
    /// 隔離解除
    QuarantineReleased {
        /// プラグインID
        plugin_id: String,
    },
    /// 権限監査エントリ
    PermissionAudit(AuditEntry),
    /// 実行制御シグナル
    ExecutionSignal(ExecutionSignal),
}

/// セキュリティイベントの受け口
///
/// `emit` はブロックしてはならない。
pub trait EventSink: Send + Sync {
    /// イベントを送出
    fn emit(&self, event: SecurityEvent);

    /// ホスト向けの通知（既定では破棄）
    fn notify(&self, _notification: HostNotification) {}
}

/// ホスト向けイベントバス
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HostNotification>,
}

impl EventBus {
    /// 新しいイベントバスを作成
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 通知を購読
    pub fn subscribe(&self) -> broadcast::Receiver<HostNotification> {
        self.sender.subscribe()
    }

    /// 通知を配信（購読者がいなくても失敗扱いにしない）
    pub fn publish(&self, notification: HostNotification) {
        if self.sender.send(notification).is_err() {
            trace!("No subscribers for host notification");
        }
    }

    /// 購読者数
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: SecurityEvent) {
        self.publish(HostNotification::SecurityEvent(event));
    }

    fn notify(&self, notification: HostNotification) {
        self.publish(notification);
    }
}

/// イベントを破棄するシンク
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SecurityEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_delivers_security_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let event = SecurityEvent::new(
            SecurityEventType::FileAccess,
            Severity::Low,
            Uuid::new_v4(),
            "demo@1.0.0",
        )
        .with_metadata("path", "/plugins/demo/data/a.txt");
        bus.emit(event.clone());

        match rx.recv().await.unwrap() {
            HostNotification::SecurityEvent(received) => {
                assert_eq!(received.id, event.id);
                assert_eq!(received.event_type, SecurityEventType::FileAccess);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(HostNotification::QuarantineReleased {
            plugin_id: "x@1.0.0".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_type_strings() {
        assert_eq!(SecurityEventType::ResourceViolation.as_str(), "resource-violation");
        assert_eq!(
            SecurityEventType::Custom("scan".to_string()).as_str(),
            "scan"
        );
        let json = serde_json::to_string(&SecurityEventType::NetworkRequest).unwrap();
        assert_eq!(json, "\"network-request\"");
    }
}
