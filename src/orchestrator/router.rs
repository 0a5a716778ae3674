//! Event Router
//!
//! 各コンポーネントのセキュリティイベントをホスト向けバスに流し、
//! 同時に振る舞い監視へ送る。

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::behavior::BehaviorMonitor;
use crate::events::{EventBus, EventSink, HostNotification, SecurityEvent};

/// イベントの分配器
///
/// 振る舞い監視自身はバスに直接送るので、ここを経由したイベントが
/// 再び振る舞い監視に戻ることはない。
pub struct EventRouter {
    bus: Arc<EventBus>,
    behavior: mpsc::UnboundedSender<SecurityEvent>,
}

impl EventRouter {
    /// ルーターと、振る舞い監視へ渡すイベントの受信側を作る
    pub fn new(bus: Arc<EventBus>) -> (Self, mpsc::UnboundedReceiver<SecurityEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                bus,
                behavior: sender,
            },
            receiver,
        )
    }
}

impl EventSink for EventRouter {
    fn emit(&self, event: SecurityEvent) {
        if self.behavior.send(event.clone()).is_err() {
            debug!("Behavior pump closed; event only published");
        }
        self.bus.emit(event);
    }

    fn notify(&self, notification: HostNotification) {
        self.bus.notify(notification);
    }
}

/// 受信したイベントを振る舞い監視に記録し続けるタスク
pub fn spawn_pump(
    mut receiver: mpsc::UnboundedReceiver<SecurityEvent>,
    behavior: BehaviorMonitor,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => {
                        if let Some(assessment) = behavior.record_event(event).await {
                            debug!(
                                execution_id = %assessment.execution_id,
                                threat_level = %assessment.threat_level,
                                "Inline behavior assessment"
                            );
                        }
                    }
                    None => {
                        warn!("Event router dropped; behavior pump exiting");
                        break;
                    }
                },
            }
        }
        debug!("Behavior pump stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BehaviorConfig;
    use crate::events::SecurityEventType;
    use crate::types::Severity;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_router_feeds_bus_and_behavior() {
        let bus = Arc::new(EventBus::new(16));
        let mut host = bus.subscribe();
        let (router, receiver) = EventRouter::new(bus.clone());
        let behavior = BehaviorMonitor::new(BehaviorConfig::default(), bus.clone());
        let token = CancellationToken::new();
        let pump = spawn_pump(receiver, behavior.clone(), token.clone());

        let execution_id = Uuid::new_v4();
        behavior.start_monitoring(execution_id, "p@1.0.0").await;
        router.emit(SecurityEvent::new(
            SecurityEventType::FileAccess,
            Severity::Info,
            execution_id,
            "p@1.0.0",
        ));

        match host.recv().await.unwrap() {
            HostNotification::SecurityEvent(event) => {
                assert_eq!(event.event_type, SecurityEventType::FileAccess)
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        let mut recorded = 0;
        for _ in 0..50 {
            recorded = behavior.events_for(execution_id).await.len();
            if recorded > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorded, 1);

        token.cancel();
        pump.await.unwrap();
    }
}
