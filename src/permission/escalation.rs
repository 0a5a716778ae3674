//! Trust Escalation
//!
//! 信頼レベル昇格の承認ルールと、プラグインごとのクールダウン・時間あたり上限。

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::types::EscalationRequest;
use crate::types::TrustLevel;

/// 承認結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub reason: String,
}

/// 昇格要求の承認者
#[async_trait]
pub trait EscalationApprover: Send + Sync {
    async fn review(&self, request: &EscalationRequest, current: TrustLevel) -> ApprovalDecision;
}

/// 設定された上限まで自動承認する既定の承認者
///
/// `system` は決して承認しない。
#[derive(Debug, Clone)]
pub struct PolicyApprover {
    pub auto_approve_up_to: TrustLevel,
    pub min_justification_len: usize,
}

#[async_trait]
impl EscalationApprover for PolicyApprover {
    async fn review(&self, request: &EscalationRequest, current: TrustLevel) -> ApprovalDecision {
        let reject = |reason: String| ApprovalDecision {
            approved: false,
            reason,
        };

        if request.requested_level == TrustLevel::System {
            return reject("system trust is never granted by escalation".to_string());
        }
        if request.requested_level <= current {
            return reject(format!(
                "requested level {} is not above current level {}",
                request.requested_level, current
            ));
        }
        if request.requested_level > self.auto_approve_up_to {
            return reject(format!(
                "level {} requires manual approval",
                request.requested_level
            ));
        }
        let justification = request.justification.trim();
        if justification.chars().count() < self.min_justification_len {
            return reject(format!(
                "justification must be at least {} characters",
                self.min_justification_len
            ));
        }
        ApprovalDecision {
            approved: true,
            reason: format!("auto-approved up to {}", self.auto_approve_up_to),
        }
    }
}

/// クールダウンと時間あたりの上限
pub struct EscalationGate {
    cooldown: Duration,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl EscalationGate {
    pub fn new(cooldown: Duration, max_per_hour: u32) -> Self {
        // 0 は昇格を完全に禁止する
        let limiter = NonZeroU32::new(max_per_hour)
            .map(|per_hour| RateLimiter::keyed(Quota::per_hour(per_hour)));
        Self {
            cooldown,
            limiter,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// 要求を受け付けられるか。受け付けた場合は記録する
    pub async fn admit(&self, plugin_id: &str) -> Result<(), String> {
        let Some(limiter) = &self.limiter else {
            return Err("escalation is disabled".to_string());
        };

        let mut last = self.last_request.lock().await;
        if let Some(previous) = last.get(plugin_id) {
            let elapsed = previous.elapsed();
            if elapsed < self.cooldown {
                return Err(format!(
                    "escalation cooldown active for another {} s",
                    (self.cooldown - elapsed).as_secs()
                ));
            }
        }
        if limiter.check_key(&plugin_id.to_string()).is_err() {
            return Err("hourly escalation quota exhausted".to_string());
        }
        last.insert(plugin_id.to_string(), Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(level: TrustLevel, justification: &str) -> EscalationRequest {
        EscalationRequest {
            plugin_id: "p@1.0.0".to_string(),
            requested_level: level,
            justification: justification.to_string(),
            requested_by: None,
        }
    }

    #[tokio::test]
    async fn test_policy_approver() {
        let approver = PolicyApprover {
            auto_approve_up_to: TrustLevel::Verified,
            min_justification_len: 10,
        };
        let ok = approver
            .review(&request(TrustLevel::Verified, "needs to read its cache"), TrustLevel::Basic)
            .await;
        assert!(ok.approved);

        let short = approver
            .review(&request(TrustLevel::Verified, "pls"), TrustLevel::Basic)
            .await;
        assert!(!short.approved);

        let too_high = approver
            .review(&request(TrustLevel::Trusted, "needs network access now"), TrustLevel::Basic)
            .await;
        assert!(!too_high.approved);

        let system = PolicyApprover {
            auto_approve_up_to: TrustLevel::System,
            min_justification_len: 0,
        }
        .review(&request(TrustLevel::System, "everything"), TrustLevel::Trusted)
        .await;
        assert!(!system.approved);
    }

    #[tokio::test]
    async fn test_gate_cooldown() {
        let gate = EscalationGate::new(Duration::from_secs(60), 10);
        assert!(gate.admit("p@1").await.is_ok());
        assert!(gate.admit("p@1").await.is_err());
        assert!(gate.admit("q@1").await.is_ok());
    }

    #[tokio::test]
    async fn test_gate_quota() {
        let gate = EscalationGate::new(Duration::ZERO, 2);
        assert!(gate.admit("p@1").await.is_ok());
        assert!(gate.admit("p@1").await.is_ok());
        assert!(gate.admit("p@1").await.is_err());

        let disabled = EscalationGate::new(Duration::ZERO, 0);
        assert!(disabled.admit("p@1").await.is_err());
    }
}
