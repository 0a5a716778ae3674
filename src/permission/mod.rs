//! Permission Manager
//!
//! ロールベースの権限管理（継承・条件付き付与・監査・信頼レベル昇格）

pub mod audit;
pub mod escalation;
pub mod manager;
pub mod roles;
pub mod scope;
pub mod types;

pub use audit::{AuditLog, AuditQuery, AuditStatistics};
pub use escalation::{ApprovalDecision, EscalationApprover, EscalationGate, PolicyApprover};
pub use manager::PermissionManager;
pub use roles::{builtin_role_name, builtin_roles, RoleRegistry, PLUGIN_PLACEHOLDER};
pub use scope::{scope_matches, PatternCache};
pub use types::{
    AuditAction, AuditEntry, ComparisonOperator, EscalationOutcome, EscalationRequest, Permission,
    PermissionCondition, PermissionDecision, PermissionScope, RevokedPermission, SecurityContext,
    SecurityRole,
};
