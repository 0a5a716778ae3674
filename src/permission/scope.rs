//! Scope and Condition Matching

use chrono::{DateTime, Timelike, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::types::{ComparisonOperator, PermissionCondition, PermissionScope};

/// パスパターンのコンパイル済み正規表現
///
/// 不正なパターンも `None` として記録し、毎回コンパイルし直さない。
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: RwLock<HashMap<String, Option<Arc<Regex>>>>,
}

impl PatternCache {
    pub fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(entry) = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
        {
            return entry.clone();
        }
        let regex = Regex::new(pattern).ok().map(Arc::new);
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.to_string(), regex.clone());
        regex
    }

    pub fn len(&self) -> usize {
        self.compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// スコープがリソースに一致するか
pub fn scope_matches(
    scope: &PermissionScope,
    resource: Option<&str>,
    context: &HashMap<String, Value>,
    patterns: &PatternCache,
) -> bool {
    match scope {
        PermissionScope::Global => true,
        PermissionScope::PathPattern(pattern) => match (resource, patterns.get(pattern)) {
            (Some(resource), Some(regex)) => regex.is_match(resource),
            _ => false,
        },
        PermissionScope::Domain(domain) => resource
            .and_then(host_of)
            .is_some_and(|host| domain_matches(domain, &host)),
        PermissionScope::Plugin(name) => resource == Some(name.as_str()),
        PermissionScope::User(user) => {
            context.get("user").and_then(Value::as_str) == Some(user.as_str())
        }
    }
}

/// URL またはホスト名からホスト部分を取り出す
pub fn host_of(resource: &str) -> Option<String> {
    let rest = match resource.split_once("://") {
        Some((_, rest)) => rest,
        None => resource,
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = match host_port.strip_prefix('[') {
        Some(v6) => v6.split(']').next()?,
        None => host_port.split(':').next()?,
    };
    if host.is_empty() {
        None
    } else {
        Some(host.trim_end_matches('.').to_ascii_lowercase())
    }
}

fn domain_matches(domain: &str, host: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    match domain.strip_prefix("*.") {
        Some(base) => host == base || host.ends_with(&format!(".{}", base)),
        None => host == domain,
    }
}

/// 条件を評価する。満たさない場合は理由を返す
pub fn evaluate_condition(
    condition: &PermissionCondition,
    context: &HashMap<String, Value>,
    usage_count: u64,
    now: DateTime<Utc>,
) -> Result<(), String> {
    match condition {
        PermissionCondition::TimeOfDay {
            start_hour,
            end_hour,
        } => {
            let hour = now.hour();
            let inside = if start_hour <= end_hour {
                hour >= *start_hour && hour < *end_hour
            } else {
                hour >= *start_hour || hour < *end_hour
            };
            if inside {
                Ok(())
            } else {
                Err(format!(
                    "outside allowed hours {:02}:00-{:02}:00 UTC",
                    start_hour, end_hour
                ))
            }
        }
        PermissionCondition::MaxUsage { limit } => {
            if usage_count < *limit {
                Ok(())
            } else {
                Err(format!("usage limit of {} reached", limit))
            }
        }
        PermissionCondition::ContextField {
            field,
            operator,
            value,
        } => {
            let Some(actual) = context.get(field) else {
                return Err(format!("context field '{}' is missing", field));
            };
            if compare(actual, *operator, value) {
                Ok(())
            } else {
                Err(format!("context field '{}' does not satisfy {:?}", field, operator))
            }
        }
    }
}

fn compare(actual: &Value, operator: ComparisonOperator, expected: &Value) -> bool {
    match operator {
        ComparisonOperator::Equals => actual == expected,
        ComparisonOperator::NotEquals => actual != expected,
        ComparisonOperator::GreaterThan => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ComparisonOperator::LessThan => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ComparisonOperator::Contains => match (actual, expected) {
            (Value::String(a), Value::String(b)) => a.contains(b.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_path_pattern_scope() {
        let scope = PermissionScope::PathPattern("^/plugins/p/data/.*".to_string());
        let ctx = HashMap::new();
        let patterns = PatternCache::default();
        assert!(scope_matches(&scope, Some("/plugins/p/data/x.json"), &ctx, &patterns));
        assert!(!scope_matches(&scope, Some("/etc/passwd"), &ctx, &patterns));
        assert!(!scope_matches(&scope, None, &ctx, &patterns));
        // 同じパターンは一度だけコンパイルされる
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let scope = PermissionScope::PathPattern("^/plugins/(".to_string());
        let patterns = PatternCache::default();
        let ctx = HashMap::new();
        assert!(!scope_matches(&scope, Some("/plugins/("), &ctx, &patterns));
        assert!(!scope_matches(&scope, Some("/plugins/("), &ctx, &patterns));
        assert_eq!(patterns.len(), 1);
        assert!(patterns.get("^/plugins/(").is_none());
    }

    #[test]
    fn test_domain_scope() {
        let ctx = HashMap::new();
        let exact = PermissionScope::Domain("api.example.com".to_string());
        let wildcard = PermissionScope::Domain("*.example.com".to_string());
        let patterns = PatternCache::default();

        assert!(scope_matches(&exact, Some("https://api.example.com/v1?q=1"), &ctx, &patterns));
        assert!(scope_matches(&exact, Some("API.example.com:8443"), &ctx, &patterns));
        assert!(!scope_matches(&exact, Some("https://api.example.com.evil.io/"), &ctx, &patterns));
        assert!(scope_matches(&wildcard, Some("https://cdn.eu.example.com"), &ctx, &patterns));
        assert!(!scope_matches(&wildcard, Some("https://notexample.com"), &ctx, &patterns));
        assert!(!scope_matches(&exact, Some("https://user@evil.io/api.example.com"), &ctx, &patterns));
    }

    #[test]
    fn test_time_of_day_wraps_midnight() {
        let condition = PermissionCondition::TimeOfDay {
            start_hour: 22,
            end_hour: 6,
        };
        let ctx = HashMap::new();
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(evaluate_condition(&condition, &ctx, 0, late).is_ok());
        assert!(evaluate_condition(&condition, &ctx, 0, noon).is_err());
    }

    #[test]
    fn test_context_field_conditions() {
        let mut ctx = HashMap::new();
        ctx.insert("region".to_string(), json!("eu-west"));
        ctx.insert("attempt".to_string(), json!(3));
        let now = Utc::now();

        let equals = PermissionCondition::ContextField {
            field: "region".to_string(),
            operator: ComparisonOperator::Contains,
            value: json!("eu"),
        };
        let less = PermissionCondition::ContextField {
            field: "attempt".to_string(),
            operator: ComparisonOperator::LessThan,
            value: json!(3),
        };
        let missing = PermissionCondition::ContextField {
            field: "tenant".to_string(),
            operator: ComparisonOperator::Equals,
            value: json!("a"),
        };
        assert!(evaluate_condition(&equals, &ctx, 0, now).is_ok());
        assert!(evaluate_condition(&less, &ctx, 0, now).is_err());
        assert!(evaluate_condition(&missing, &ctx, 0, now).is_err());
    }
}
