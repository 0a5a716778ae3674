//! Behavior Patterns
//!
//! 組み込みパターンと、時間窓内の順序付き部分列マッチング。

use chrono::{DateTime, Duration, Utc};

use super::types::{BehaviorPattern, PatternMatch, PatternStep};
use crate::emergency::EmergencyAction;
use crate::events::{SecurityEvent, SecurityEventType};
use crate::types::Severity;

fn step(event_type: SecurityEventType, count: usize) -> PatternStep {
    PatternStep { event_type, count }
}

/// 組み込みパターン
pub fn builtin_patterns() -> Vec<BehaviorPattern> {
    vec![
        BehaviorPattern {
            id: "data-exfiltration".to_string(),
            description: "Repeated file reads followed by a network request".to_string(),
            steps: vec![
                step(SecurityEventType::FileAccess, 3),
                step(SecurityEventType::NetworkRequest, 1),
            ],
            window_secs: 60,
            severity: Severity::Critical,
            weight: 40.0,
            actions: vec![
                EmergencyAction::Isolate,
                EmergencyAction::Terminate,
                EmergencyAction::ForensicCapture,
                EmergencyAction::Alert,
            ],
        },
        BehaviorPattern {
            id: "resource-exhaustion".to_string(),
            description: "Sustained resource limit violations".to_string(),
            steps: vec![step(SecurityEventType::ResourceViolation, 10)],
            window_secs: 120,
            severity: Severity::High,
            weight: 30.0,
            actions: vec![
                EmergencyAction::Restrict,
                EmergencyAction::Isolate,
                EmergencyAction::Alert,
            ],
        },
        BehaviorPattern {
            id: "privilege-probing".to_string(),
            description: "Repeated permission denials".to_string(),
            steps: vec![step(SecurityEventType::PermissionDenied, 5)],
            window_secs: 60,
            severity: Severity::High,
            weight: 25.0,
            actions: vec![EmergencyAction::Restrict, EmergencyAction::Alert],
        },
        BehaviorPattern {
            id: "sandbox-escape".to_string(),
            description: "Repeated attempts to reach outside the mediated capability surface"
                .to_string(),
            steps: vec![step(SecurityEventType::CapabilityDenied, 3)],
            window_secs: 30,
            severity: Severity::Critical,
            weight: 40.0,
            actions: vec![
                EmergencyAction::Terminate,
                EmergencyAction::Quarantine,
                EmergencyAction::ForensicCapture,
                EmergencyAction::Alert,
            ],
        },
        BehaviorPattern {
            id: "storage-flooding".to_string(),
            description: "High-rate storage access".to_string(),
            steps: vec![step(SecurityEventType::StorageAccess, 50)],
            window_secs: 10,
            severity: Severity::Medium,
            weight: 15.0,
            actions: vec![EmergencyAction::Throttle, EmergencyAction::Monitor],
        },
    ]
}

/// パターンとの一致を探す
///
/// `events` は時刻順。`now - window` 以降のイベントだけを使い、
/// 各ステップを必要件数ぶん順に満たしたら一致とする。
pub fn match_pattern(
    pattern: &BehaviorPattern,
    events: &[SecurityEvent],
    now: DateTime<Utc>,
) -> Option<PatternMatch> {
    if pattern.steps.is_empty() {
        return None;
    }
    let since = now - Duration::seconds(pattern.window_secs as i64);

    let mut step_index = 0;
    let mut seen = 0;
    let mut used = 0;
    let mut first_event_at = None;

    for event in events.iter().filter(|e| e.timestamp >= since && e.timestamp <= now) {
        let current = &pattern.steps[step_index];
        if event.event_type != current.event_type {
            continue;
        }
        first_event_at.get_or_insert(event.timestamp);
        seen += 1;
        used += 1;
        if seen >= current.count.max(1) {
            step_index += 1;
            seen = 0;
            if step_index == pattern.steps.len() {
                return Some(PatternMatch {
                    pattern_id: pattern.id.clone(),
                    description: pattern.description.clone(),
                    severity: pattern.severity,
                    weight: pattern.weight,
                    event_count: used,
                    first_event_at: first_event_at.unwrap_or(event.timestamp),
                    matched_at: event.timestamp,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn events(types: &[SecurityEventType], start: DateTime<Utc>, gap_ms: i64) -> Vec<SecurityEvent> {
        let id = Uuid::new_v4();
        types
            .iter()
            .enumerate()
            .map(|(i, t)| {
                SecurityEvent::new(t.clone(), Severity::Low, id, "p@1.0.0")
                    .at(start + Duration::milliseconds(gap_ms * i as i64))
            })
            .collect()
    }

    fn pattern(id: &str) -> BehaviorPattern {
        builtin_patterns().into_iter().find(|p| p.id == id).unwrap()
    }

    #[test]
    fn test_exfiltration_requires_order() {
        use SecurityEventType::*;
        let start = Utc::now() - Duration::seconds(5);
        let ordered = events(&[FileAccess, Log, FileAccess, FileAccess, NetworkRequest], start, 100);
        let reversed = events(&[NetworkRequest, FileAccess, FileAccess, FileAccess], start, 100);

        let found = match_pattern(&pattern("data-exfiltration"), &ordered, Utc::now()).unwrap();
        assert_eq!(found.event_count, 4);
        assert!(match_pattern(&pattern("data-exfiltration"), &reversed, Utc::now()).is_none());
    }

    #[test]
    fn test_window_excludes_old_events() {
        let types = vec![SecurityEventType::CapabilityDenied; 3];
        let old = events(&types, Utc::now() - Duration::seconds(120), 10);
        let fresh = events(&types, Utc::now() - Duration::seconds(1), 10);

        assert!(match_pattern(&pattern("sandbox-escape"), &old, Utc::now()).is_none());
        assert!(match_pattern(&pattern("sandbox-escape"), &fresh, Utc::now()).is_some());
    }

    #[test]
    fn test_resource_exhaustion_threshold() {
        let nine = events(&vec![SecurityEventType::ResourceViolation; 9], Utc::now() - Duration::seconds(30), 1000);
        let ten = events(&vec![SecurityEventType::ResourceViolation; 10], Utc::now() - Duration::seconds(30), 1000);
        assert!(match_pattern(&pattern("resource-exhaustion"), &nine, Utc::now()).is_none());
        assert!(match_pattern(&pattern("resource-exhaustion"), &ten, Utc::now()).is_some());
    }
}
