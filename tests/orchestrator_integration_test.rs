//! Security Orchestrator Integration Tests
//!
//! 評価から実行、緊急対応までの流れを結合した状態で確認します。

use async_trait::async_trait;
use chrono::{Duration, Utc};
use plugin_sentinel::behavior::BehaviorMonitor;
use plugin_sentinel::config::{BehaviorConfig, SentinelConfig};
use plugin_sentinel::emergency::{
    ActionOutcome, EmergencyAction, EmergencyRequest, EmergencyResponse, EmergencyTrigger,
    ThreatResponder,
};
use plugin_sentinel::events::{EventBus, HostNotification, SecurityEvent, SecurityEventType};
use plugin_sentinel::orchestrator::{ExecutionBlocker, SecurityOrchestrator};
use plugin_sentinel::plugin::{Plugin, PluginManifest};
use plugin_sentinel::resource::{StaticSystemSampler, SystemSnapshot};
use plugin_sentinel::sandbox::ExecutionErrorKind;
use plugin_sentinel::signature::{
    sign_plugin, PublisherKey, SignatureAlgorithm, TrustedPublisher,
};
use plugin_sentinel::types::{ExecutionId, Severity, TrustLevel};
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn test_plugin(name: &str, capabilities: &[&str], source: &str) -> Plugin {
    let manifest = PluginManifest::from_json(
        &json!({
            "name": name,
            "version": "1.0.0",
            "description": "integration test plugin",
            "capabilities": capabilities,
            "entryPoints": ["run"],
        })
        .to_string(),
    )
    .unwrap();
    Plugin::new(manifest, source).unwrap()
}

/// テスト用のオーケストレーターを作成（ファイルはテンポラリに置く）
async fn create_orchestrator(
    dir: &tempfile::TempDir,
    configure: impl FnOnce(&mut SentinelConfig),
) -> SecurityOrchestrator {
    let mut config = SentinelConfig::default();
    config.sandbox.fs_root = dir.path().join("plugins");
    config.emergency.incident_dir = Some(dir.path().join("incidents"));
    config.emergency.quarantine_path = Some(dir.path().join("quarantine.json"));
    configure(&mut config);
    SecurityOrchestrator::with_system_sampler(
        config,
        Arc::new(StaticSystemSampler(SystemSnapshot::default())),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_timeout_records_incident() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(&dir, |config| {
        config.signature.require_signature = false;
        config.sandbox.max_execution_time_ms = 300;
        config.sandbox.max_operations = 1_000_000_000_000;
    })
    .await;
    let plugin = test_plugin("spinner", &["log"], "fn run() { let x = 0; loop { x += 1; } }");

    let result = orchestrator.execute_plugin(&plugin, "run", Vec::new()).await;
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Timeout));
    assert!(result.error.as_ref().unwrap().message.contains("timeout"));

    let incidents = orchestrator
        .emergency()
        .incidents_for_plugin(&plugin.id())
        .await;
    assert_eq!(incidents.len(), 1);
    assert!(matches!(
        incidents[0].trigger,
        EmergencyTrigger::InfiniteLoop | EmergencyTrigger::ResourceExhaustion
    ));
    assert_eq!(incidents[0].actions[0].action, EmergencyAction::Terminate);
    assert!(dir.path().join("incidents").join("incidents.log").exists());
}

#[tokio::test]
async fn test_unsigned_plugin_blocked_when_required() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(&dir, |config| {
        config.signature.require_signature = true;
    })
    .await;
    let plugin = test_plugin("unsigned", &["log"], "fn run() { 42 }");

    let assessment = orchestrator.assess_plugin(&plugin, None).await;
    assert!(!assessment.signature.valid);
    assert_eq!(assessment.signature.trust_level, TrustLevel::Untrusted);
    assert!(assessment
        .blockers
        .contains(&ExecutionBlocker::InvalidSignature));
    assert!(!assessment.execution_allowed);

    let result = orchestrator.execute_plugin(&plugin, "run", Vec::new()).await;
    assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Blocked));
    assert_eq!(orchestrator.security_posture().await.active_executions, 0);
}

/// 信頼済み発行者 `acme` を登録して鍵を返す
async fn register_acme(orchestrator: &SecurityOrchestrator) -> PublisherKey {
    let (key, _pkcs8) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
    orchestrator
        .verifier()
        .add_publisher(TrustedPublisher {
            key_id: "acme".to_string(),
            name: "Acme".to_string(),
            public_key: key.public_key_base64(),
            algorithm: SignatureAlgorithm::Ed25519,
            trust_level: TrustLevel::Trusted,
            valid_from: Utc::now() - Duration::days(1),
            valid_until: None,
            permissions: Vec::new(),
            revoked: false,
        })
        .await
        .unwrap();
    key
}

fn writer_plugin() -> Plugin {
    test_plugin(
        "writer",
        &["fs"],
        r#"fn run(text) { fs_write_file("notes/out.txt", text); fs_read_file("notes/out.txt") }"#,
    )
}

#[tokio::test]
async fn test_signed_trusted_plugin_writes_own_data() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(&dir, |_| {}).await;
    let key = register_acme(&orchestrator).await;

    let plugin = writer_plugin();
    let signature = sign_plugin(&plugin, &key, "acme", Utc::now()).unwrap();

    let assessment = orchestrator.assess_plugin(&plugin, Some(&signature)).await;
    assert!(assessment.signature.valid, "{:?}", assessment.signature.errors);
    assert_eq!(assessment.trust_level, TrustLevel::Trusted);
    assert!(assessment.execution_allowed, "{:?}", assessment.blockers);

    let result = orchestrator
        .execute_plugin(&plugin, "run", vec![json!("hello")])
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(json!("hello")));
    assert!(dir
        .path()
        .join("plugins/writer/data/notes/out.txt")
        .exists());
}

#[tokio::test]
async fn test_revoked_key_blocks_previously_assessed_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(&dir, |config| {
        config.signature.require_signature = true;
    })
    .await;
    let key = register_acme(&orchestrator).await;
    let plugin = writer_plugin();
    let signature = sign_plugin(&plugin, &key, "acme", Utc::now()).unwrap();

    let assessment = orchestrator.assess_plugin(&plugin, Some(&signature)).await;
    assert!(assessment.execution_allowed, "{:?}", assessment.blockers);

    // 評価の後で鍵が漏洩した
    orchestrator
        .verifier()
        .revoke_key("acme", "key compromised")
        .await
        .unwrap();

    let result = orchestrator
        .execute_plugin(&plugin, "run", vec![json!("exfiltrated")])
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Blocked));
    assert!(!dir
        .path()
        .join("plugins/writer/data/notes/out.txt")
        .exists());
}

#[tokio::test]
async fn test_revoke_key_downgrades_context() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(&dir, |config| {
        config.signature.require_signature = false;
    })
    .await;
    let key = register_acme(&orchestrator).await;
    let plugin = writer_plugin();
    let signature = sign_plugin(&plugin, &key, "acme", Utc::now()).unwrap();

    orchestrator.assess_plugin(&plugin, Some(&signature)).await;
    let context = orchestrator.permissions().context(&plugin.id()).await.unwrap();
    assert_eq!(context.trust_level, TrustLevel::Trusted);

    orchestrator.revoke_key("acme", "key compromised").await.unwrap();

    assert!(orchestrator.latest_assessment(&plugin.id()).await.is_none());
    let context = orchestrator.permissions().context(&plugin.id()).await.unwrap();
    assert_eq!(context.trust_level, TrustLevel::Untrusted);
    let write = orchestrator
        .permissions()
        .check_permission(
            &plugin.id(),
            "fs.write",
            Some("/plugins/writer/data/notes/out.txt"),
            &std::collections::HashMap::new(),
        )
        .await;
    assert!(!write.granted);

    // 署名なしで評価し直されるので untrusted のまま動き、書き込みは拒否される
    let result = orchestrator
        .execute_plugin(&plugin, "run", vec![json!("hello")])
        .await;
    assert!(!result.success);
    assert!(!dir
        .path()
        .join("plugins/writer/data/notes/out.txt")
        .exists());
}

#[tokio::test]
async fn test_emergency_trigger_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = create_orchestrator(&dir, |_| {}).await;
    let mut notifications = orchestrator.subscribe();

    let execution_id = Uuid::new_v4();
    orchestrator
        .emergency()
        .register_execution(execution_id, "rogue@1.0.0")
        .await;

    let first = orchestrator
        .trigger_emergency(execution_id, "rogue@1.0.0", "operator intervention")
        .await;
    assert!(first.success, "{}", first.message);
    assert!(first.incident_id.is_some());

    let second = orchestrator
        .trigger_emergency(execution_id, "rogue@1.0.0", "operator intervention")
        .await;
    assert!(!second.success);
    assert!(second.incident_id.is_none());

    assert_eq!(orchestrator.emergency().incident_count().await, 1);
    // critical な既定アクションには隔離が含まれる
    assert!(orchestrator.emergency().is_quarantined("rogue@1.0.0").await);

    let mut saw_emergency = false;
    while let Ok(notification) = notifications.try_recv() {
        if matches!(notification, HostNotification::Emergency(_)) {
            saw_emergency = true;
        }
    }
    assert!(saw_emergency);
}

/// 依頼されたアクションを記録する
#[derive(Default)]
struct RecordingResponder {
    actions: Mutex<Vec<EmergencyAction>>,
}

#[async_trait]
impl ThreatResponder for RecordingResponder {
    async fn trigger_emergency(&self, _request: EmergencyRequest) -> EmergencyResponse {
        EmergencyResponse::rejected("not under test")
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

#[tokio::test]
async fn test_repeated_resource_violations_raise_suspicious_behavior() {
    let bus = Arc::new(EventBus::new(64));
    let mut notifications = bus.subscribe();
    let monitor = BehaviorMonitor::new(
        BehaviorConfig {
            automated_response: true,
            ..BehaviorConfig::default()
        },
        bus.clone(),
    );
    let responder = Arc::new(RecordingResponder::default());
    monitor.set_responder(responder.clone()).await;

    let execution_id = Uuid::new_v4();
    monitor.start_monitoring(execution_id, "hog@1.0.0").await;
    for _ in 0..10 {
        monitor
            .record_event(SecurityEvent::new(
                SecurityEventType::ResourceViolation,
                Severity::Medium,
                execution_id,
                "hog@1.0.0",
            ))
            .await;
    }

    let mut suspicious = 0;
    while let Ok(notification) = notifications.try_recv() {
        if let HostNotification::SecurityEvent(event) = notification {
            if event.event_type == SecurityEventType::SuspiciousBehavior {
                suspicious += 1;
            }
        }
    }
    assert_eq!(suspicious, 1);

    let actions = responder.actions.lock().unwrap().clone();
    assert_eq!(actions.len(), 1);
    assert!(matches!(
        actions[0],
        EmergencyAction::Isolate | EmergencyAction::Restrict
    ));
}

#[tokio::test]
async fn test_quarantine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = test_plugin("flagged", &["log"], "fn run() { 1 }");
    {
        let orchestrator = create_orchestrator(&dir, |config| {
            config.signature.require_signature = false;
        })
        .await;
        orchestrator
            .emergency()
            .quarantine_plugin(&plugin.id(), "suspected exfiltration", None)
            .await
            .unwrap();
        orchestrator.shutdown().await;
    }

    let orchestrator = create_orchestrator(&dir, |config| {
        config.signature.require_signature = false;
    })
    .await;
    let result = orchestrator.execute_plugin(&plugin, "run", Vec::new()).await;
    assert_eq!(result.error_kind(), Some(ExecutionErrorKind::Quarantined));

    assert!(orchestrator
        .emergency()
        .release_quarantine(&plugin.id())
        .await
        .unwrap());
    let result = orchestrator.execute_plugin(&plugin, "run", Vec::new()).await;
    assert!(result.success, "{:?}", result.error);
}
