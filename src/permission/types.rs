//! Permission Manager Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::types::{SandboxLevel, TrustLevel};

/// 権限のリソーススコープ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum PermissionScope {
    /// すべてのリソース
    Global,
    /// パスに対する正規表現
    PathPattern(String),
    /// ホスト名（`*.example.com` でサブドメインも許可）
    Domain(String),
    /// 特定のプラグイン
    Plugin(String),
    /// 特定のユーザー（コンテキストの `user` と比較）
    User(String),
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionScope::Global => write!(f, "global"),
            PermissionScope::PathPattern(p) => write!(f, "path:{}", p),
            PermissionScope::Domain(d) => write!(f, "domain:{}", d),
            PermissionScope::Plugin(p) => write!(f, "plugin:{}", p),
            PermissionScope::User(u) => write!(f, "user:{}", u),
        }
    }
}

/// 比較演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
}

/// 権限に付く条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PermissionCondition {
    /// UTC の時間帯 [start_hour, end_hour)。start > end は日付をまたぐ
    TimeOfDay { start_hour: u32, end_hour: u32 },
    /// 使用回数の上限
    MaxUsage { limit: u64 },
    /// コンテキストの値との比較
    ContextField {
        field: String,
        operator: ComparisonOperator,
        value: Value,
    },
}

/// 権限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// 権限の種類（`fs.read` など。`*` と `fs.*` はワイルドカード）
    pub permission_type: String,
    /// スコープ
    pub scope: PermissionScope,
    /// 許可か（false は明示的な拒否）
    pub granted: bool,
    /// 有効期限
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// 条件
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PermissionCondition>,
}

impl Permission {
    /// 許可権限
    pub fn allow(permission_type: impl Into<String>, scope: PermissionScope) -> Self {
        Self {
            permission_type: permission_type.into(),
            scope,
            granted: true,
            expires_at: None,
            conditions: Vec::new(),
        }
    }

    /// 明示的な拒否
    pub fn deny(permission_type: impl Into<String>, scope: PermissionScope) -> Self {
        Self {
            granted: false,
            ..Self::allow(permission_type, scope)
        }
    }

    pub fn expiring(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_condition(mut self, condition: PermissionCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// 権限の種類が一致するか
    pub fn covers_type(&self, permission_type: &str) -> bool {
        if self.permission_type == "*" || self.permission_type == permission_type {
            return true;
        }
        match self.permission_type.strip_suffix(".*") {
            Some(prefix) => permission_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => false,
        }
    }
}

/// 名前付きの権限セット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRole {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// 継承するロール（未登録の名前は無視される）
    #[serde(default)]
    pub inherits: Vec<String>,
}

impl SecurityRole {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            permissions: Vec::new(),
            inherits: Vec::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn inheriting(mut self, role: impl Into<String>) -> Self {
        self.inherits.push(role.into());
        self
    }
}

/// プラグインごとのセキュリティコンテキスト
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    /// `name@version`
    pub plugin_id: String,
    /// プラグイン名（スコープの `{plugin}` 置換に使う）
    pub plugin_name: String,
    pub trust_level: TrustLevel,
    pub sandbox_level: SandboxLevel,
    /// 割り当てられたロール（直接指定分）
    pub roles: BTreeSet<String>,
    /// 継承を含めて解決されたロール
    pub resolved_roles: BTreeSet<String>,
    /// ロールから展開された権限
    pub role_permissions: Vec<Permission>,
    /// 個別に付与された権限（信頼レベル変更後も維持）
    pub grants: Vec<Permission>,
    /// 取り消されたロール由来の権限。ロールを再展開するたびに適用する
    #[serde(default)]
    pub revoked: Vec<RevokedPermission>,
    pub created_at: DateTime<Utc>,
}

impl SecurityContext {
    /// 評価対象の全権限（個別付与が先）
    pub fn permissions(&self) -> impl Iterator<Item = &Permission> {
        self.grants.iter().chain(self.role_permissions.iter())
    }

    /// ロールから展開した権限を差し替え、取り消し済みのものを除く
    pub fn set_role_permissions(&mut self, permissions: Vec<Permission>) {
        self.role_permissions = permissions;
        let revoked = &self.revoked;
        self.role_permissions
            .retain(|p| !revoked.iter().any(|r| r.covers(p)));
    }
}

/// ロール由来の権限の取り消し
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokedPermission {
    pub permission_type: String,
    /// None なら種類が一致するものすべて
    pub scope: Option<PermissionScope>,
}

impl RevokedPermission {
    pub fn covers(&self, permission: &Permission) -> bool {
        permission.permission_type == self.permission_type
            && self.scope.as_ref().map_or(true, |s| &permission.scope == s)
    }
}

/// 権限チェックの結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub granted: bool,
    pub reason: String,
    /// 一致した権限のスコープ
    pub matched_scope: Option<PermissionScope>,
    #[serde(default)]
    pub cached: bool,
}

impl PermissionDecision {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: reason.into(),
            matched_scope: None,
            cached: false,
        }
    }
}

/// 監査対象の操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Check,
    Grant,
    Revoke,
    AssignRole,
    ContextCreated,
    Escalation,
}

/// 監査ログのエントリ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub plugin_id: String,
    pub permission: String,
    pub resource: Option<String>,
    /// 許可されたか（操作が成功したか）
    pub granted: bool,
    pub reason: String,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        plugin_id: &str,
        permission: &str,
        resource: Option<&str>,
        granted: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            plugin_id: plugin_id.to_string(),
            permission: permission.to_string(),
            resource: resource.map(str::to_string),
            granted,
            reason: reason.into(),
        }
    }
}

/// 信頼レベル昇格の要求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub plugin_id: String,
    pub requested_level: TrustLevel,
    pub justification: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// 昇格の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationOutcome {
    pub approved: bool,
    pub previous_level: TrustLevel,
    pub current_level: TrustLevel,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_wildcards() {
        let all = Permission::allow("*", PermissionScope::Global);
        let fs = Permission::allow("fs.*", PermissionScope::Global);
        assert!(all.covers_type("network.http"));
        assert!(fs.covers_type("fs.read"));
        assert!(fs.covers_type("fs.write"));
        assert!(!fs.covers_type("fsx.read"));
        assert!(!fs.covers_type("storage.read"));
    }

    #[test]
    fn test_scope_serde() {
        let scope = PermissionScope::PathPattern("^/plugins/p/data/.*".to_string());
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["type"], "path-pattern");
        let back: PermissionScope = serde_json::from_value(json).unwrap();
        assert_eq!(back, scope);
    }
}
