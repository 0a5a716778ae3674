//! Permission Manager
//!
//! 既定は拒否。ロールを継承込みで展開した権限とプラグイン個別の付与から判定し、
//! すべての判定を監査ログに残す。判定結果は短い TTL でキャッシュし、
//! 付与・取り消し・昇格のたびにそのプラグインの分を破棄する。

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::audit::{AuditLog, AuditQuery, AuditStatistics};
use super::escalation::{EscalationApprover, EscalationGate, PolicyApprover};
use super::roles::{builtin_role_name, RoleRegistry};
use super::scope::{evaluate_condition, scope_matches, PatternCache};
use super::types::{
    AuditAction, AuditEntry, EscalationOutcome, EscalationRequest, Permission, PermissionDecision,
    PermissionScope, RevokedPermission, SecurityContext, SecurityRole,
};
use crate::config::PermissionConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, HostNotification};
use crate::sandbox::{AuthorizationDecision, CapabilityAuthorizer};
use crate::types::TrustLevel;

type CacheKey = (String, String, Option<String>);

struct CachedDecision {
    decision: PermissionDecision,
    expires: Instant,
}

/// 判定キャッシュ
///
/// 破棄のたびに世代を進める。評価を始めた時点の世代と一致しない結果は格納しない。
#[derive(Default)]
struct DecisionCache {
    entries: HashMap<CacheKey, CachedDecision>,
    epoch: u64,
}

impl DecisionCache {
    fn get(&self, key: &CacheKey) -> Option<PermissionDecision> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires > Instant::now())
            .map(|entry| entry.decision.clone())
    }

    /// 評価中に破棄が入っていれば false
    fn insert_if_current(
        &mut self,
        epoch: u64,
        key: CacheKey,
        decision: PermissionDecision,
        expires: Instant,
    ) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.entries.insert(key, CachedDecision { decision, expires });
        true
    }

    fn invalidate_plugin(&mut self, plugin_id: &str) {
        self.epoch += 1;
        self.entries.retain(|(plugin, _, _), _| plugin != plugin_id);
    }

    fn clear(&mut self) {
        self.epoch += 1;
        self.entries.clear();
    }
}

/// 権限マネージャー
pub struct PermissionManager {
    config: PermissionConfig,
    roles: RwLock<RoleRegistry>,
    contexts: RwLock<HashMap<String, SecurityContext>>,
    cache: RwLock<DecisionCache>,
    patterns: PatternCache,
    usage: RwLock<HashMap<(String, String), u64>>,
    audit: AuditLog,
    approver: Arc<dyn EscalationApprover>,
    gate: EscalationGate,
    events: Arc<dyn EventSink>,
}

impl PermissionManager {
    pub fn new(config: PermissionConfig, events: Arc<dyn EventSink>) -> Self {
        let approver = Arc::new(PolicyApprover {
            auto_approve_up_to: config.auto_approve_up_to,
            min_justification_len: config.min_justification_len,
        });
        Self {
            audit: AuditLog::new(config.audit_max_entries, config.audit_log_path.clone()),
            gate: EscalationGate::new(
                Duration::from_secs(config.escalation_cooldown_secs),
                config.escalation_max_per_hour,
            ),
            config,
            roles: RwLock::new(RoleRegistry::with_builtins()),
            contexts: RwLock::new(HashMap::new()),
            cache: RwLock::new(DecisionCache::default()),
            patterns: PatternCache::default(),
            usage: RwLock::new(HashMap::new()),
            approver,
            events,
        }
    }

    /// 承認者を差し替える
    pub fn with_approver(mut self, approver: Arc<dyn EscalationApprover>) -> Self {
        self.approver = approver;
        self
    }

    /// 信頼レベルから新しいコンテキストを作成（既存のものは置き換える）
    #[instrument(skip(self))]
    pub async fn create_context(
        &self,
        plugin_id: &str,
        plugin_name: &str,
        trust_level: TrustLevel,
    ) -> SecurityContext {
        let mut roles = BTreeSet::new();
        roles.insert(builtin_role_name(trust_level));

        // 取り消しは評価し直しても元に戻らない
        let revoked = self
            .contexts
            .read()
            .await
            .get(plugin_id)
            .map(|existing| existing.revoked.clone())
            .unwrap_or_default();
        let context = self
            .build_context(plugin_id, plugin_name, trust_level, roles, Vec::new(), revoked)
            .await;
        self.contexts
            .write()
            .await
            .insert(plugin_id.to_string(), context.clone());
        self.invalidate(plugin_id).await;

        self.audit
            .append(AuditEntry::new(
                AuditAction::ContextCreated,
                plugin_id,
                &builtin_role_name(trust_level),
                None,
                true,
                format!(
                    "context created with {} permissions",
                    context.role_permissions.len()
                ),
            ))
            .await;
        info!(
            trust_level = %trust_level,
            permissions = context.role_permissions.len(),
            "Security context created"
        );
        context
    }

    async fn build_context(
        &self,
        plugin_id: &str,
        plugin_name: &str,
        trust_level: TrustLevel,
        roles: BTreeSet<String>,
        grants: Vec<Permission>,
        revoked: Vec<RevokedPermission>,
    ) -> SecurityContext {
        let flat = self.roles.read().await.flatten(&roles, plugin_name);
        if !flat.missing.is_empty() {
            debug!("Unregistered roles ignored: {:?}", flat.missing);
        }
        let mut context = SecurityContext {
            plugin_id: plugin_id.to_string(),
            plugin_name: plugin_name.to_string(),
            trust_level,
            sandbox_level: trust_level.sandbox_level(),
            roles,
            resolved_roles: flat.resolved,
            role_permissions: Vec::new(),
            grants,
            revoked,
            created_at: Utc::now(),
        };
        context.set_role_permissions(flat.permissions);
        context
    }

    /// コンテキストを取得
    pub async fn context(&self, plugin_id: &str) -> Option<SecurityContext> {
        self.contexts.read().await.get(plugin_id).cloned()
    }

    /// コンテキストを削除
    pub async fn remove_context(&self, plugin_id: &str) -> Option<SecurityContext> {
        let removed = self.contexts.write().await.remove(plugin_id);
        self.invalidate(plugin_id).await;
        removed
    }

    /// 権限をチェック
    pub async fn check_permission(
        &self,
        plugin_id: &str,
        permission: &str,
        resource: Option<&str>,
        context: &HashMap<String, Value>,
    ) -> PermissionDecision {
        let key: CacheKey = (
            plugin_id.to_string(),
            permission.to_string(),
            resource.map(str::to_string),
        );

        let (cached, epoch) = {
            let cache = self.cache.read().await;
            (cache.get(&key), cache.epoch)
        };
        let decision = match cached {
            Some(mut decision) => {
                decision.cached = true;
                decision
            }
            None => {
                let (decision, cache_until) =
                    self.evaluate(plugin_id, permission, resource, context).await;
                if let Some(expires) = cache_until {
                    let stored = self.cache.write().await.insert_if_current(
                        epoch,
                        key,
                        decision.clone(),
                        expires,
                    );
                    if !stored {
                        debug!(plugin_id, permission, "Decision not cached: invalidated during evaluation");
                    }
                }
                decision
            }
        };

        if decision.granted {
            *self
                .usage
                .write()
                .await
                .entry((plugin_id.to_string(), permission.to_string()))
                .or_insert(0) += 1;
        }

        let entry = AuditEntry::new(
            AuditAction::Check,
            plugin_id,
            permission,
            resource,
            decision.granted,
            decision.reason.clone(),
        );
        if decision.granted {
            debug!(plugin_id, permission, resource, "Permission granted");
        } else {
            warn!(plugin_id, permission, resource, reason = %decision.reason, "Permission denied");
            self.events
                .notify(HostNotification::PermissionAudit(entry.clone()));
        }
        self.audit.append(entry).await;

        decision
    }

    /// 判定本体。キャッシュ可能なら有効期限を返す
    async fn evaluate(
        &self,
        plugin_id: &str,
        permission: &str,
        resource: Option<&str>,
        context: &HashMap<String, Value>,
    ) -> (PermissionDecision, Option<Instant>) {
        let now = Utc::now();
        let contexts = self.contexts.read().await;
        let Some(security_context) = contexts.get(plugin_id) else {
            return (
                PermissionDecision::denied(format!("no security context for {}", plugin_id)),
                None,
            );
        };

        let relevant: Vec<&Permission> = security_context
            .permissions()
            .filter(|p| p.covers_type(permission))
            .collect();
        // 条件付き・ユーザースコープの権限があると結果が呼び出しごとに変わる
        let context_dependent = relevant
            .iter()
            .any(|p| !p.conditions.is_empty() || matches!(p.scope, PermissionScope::User(_)));
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let mut cache_until = if context_dependent || ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        let matching: Vec<&Permission> = relevant
            .into_iter()
            .filter(|p| {
                !p.is_expired(now) && scope_matches(&p.scope, resource, context, &self.patterns)
            })
            .collect();

        if let Some(denial) = matching.iter().find(|p| !p.granted) {
            return (
                PermissionDecision {
                    granted: false,
                    reason: format!("{} explicitly denied for {}", permission, denial.scope),
                    matched_scope: Some(denial.scope.clone()),
                    cached: false,
                },
                cache_until,
            );
        }

        let usage_count = self
            .usage
            .read()
            .await
            .get(&(plugin_id.to_string(), permission.to_string()))
            .copied()
            .unwrap_or(0);

        let mut last_failure = None;
        for candidate in &matching {
            match candidate
                .conditions
                .iter()
                .try_for_each(|c| evaluate_condition(c, context, usage_count, now))
            {
                Ok(()) => {
                    // 期限付きの許可は期限を越えてキャッシュしない
                    if let (Some(until), Some(expires_at)) = (cache_until, candidate.expires_at) {
                        let remaining = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
                        cache_until = Some(until.min(Instant::now() + remaining));
                    }
                    return (
                        PermissionDecision {
                            granted: true,
                            reason: format!("{} granted by {}", permission, candidate.scope),
                            matched_scope: Some(candidate.scope.clone()),
                            cached: false,
                        },
                        cache_until,
                    );
                }
                Err(reason) => last_failure = Some(reason),
            }
        }

        let reason = match last_failure {
            Some(reason) => format!("{} condition not met: {}", permission, reason),
            None => match resource {
                Some(resource) => format!("no grant for {} on {}", permission, resource),
                None => format!("no grant for {}", permission),
            },
        };
        (PermissionDecision::denied(reason), cache_until)
    }

    /// 権限を個別に付与
    #[instrument(skip(self, permission), fields(permission = %permission.permission_type))]
    pub async fn grant_permission(&self, plugin_id: &str, permission: Permission) -> Result<()> {
        if let PermissionScope::PathPattern(pattern) = &permission.scope {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(Error::InvalidInput(format!("path pattern '{}': {}", pattern, e)));
            }
            self.patterns.get(pattern);
        }

        let scope = permission.scope.to_string();
        let permission_type = permission.permission_type.clone();
        {
            let mut contexts = self.contexts.write().await;
            let context = contexts
                .get_mut(plugin_id)
                .ok_or_else(|| Error::NotFound(format!("security context for {}", plugin_id)))?;
            context.grants.push(permission);
        }
        self.invalidate(plugin_id).await;

        self.audit
            .append(AuditEntry::new(
                AuditAction::Grant,
                plugin_id,
                &permission_type,
                Some(&scope),
                true,
                "permission granted",
            ))
            .await;
        info!("Granted {} ({}) to {}", permission_type, scope, plugin_id);
        Ok(())
    }

    /// 権限を取り消す。`scope` が None なら種類が一致するものすべて
    ///
    /// ロール由来の権限は取り消しとして記録し、ロールの再展開や再評価でも戻さない。
    /// 取り消した後に個別付与した権限は有効になる。
    pub async fn revoke_permission(
        &self,
        plugin_id: &str,
        permission_type: &str,
        scope: Option<&PermissionScope>,
    ) -> Result<usize> {
        let removed = {
            let mut contexts = self.contexts.write().await;
            let context = contexts
                .get_mut(plugin_id)
                .ok_or_else(|| Error::NotFound(format!("security context for {}", plugin_id)))?;
            let keep = |p: &Permission| {
                !(p.permission_type == permission_type && scope.map_or(true, |s| &p.scope == s))
            };
            let before = context.grants.len() + context.role_permissions.len();
            context.grants.retain(keep);
            let revocation = RevokedPermission {
                permission_type: permission_type.to_string(),
                scope: scope.cloned(),
            };
            if !context.revoked.contains(&revocation) {
                context.revoked.push(revocation);
            }
            let role_permissions = std::mem::take(&mut context.role_permissions);
            context.set_role_permissions(role_permissions);
            before - context.grants.len() - context.role_permissions.len()
        };
        self.invalidate(plugin_id).await;

        let scope_text = scope.map(|s| s.to_string());
        self.audit
            .append(AuditEntry::new(
                AuditAction::Revoke,
                plugin_id,
                permission_type,
                scope_text.as_deref(),
                removed > 0,
                format!("{} permission(s) revoked", removed),
            ))
            .await;
        info!("Revoked {} {} permission(s) from {}", removed, permission_type, plugin_id);
        Ok(removed)
    }

    /// ロールを登録。既存コンテキストは再展開する
    pub async fn register_role(&self, role: SecurityRole) {
        info!("Registering role '{}'", role.name);
        self.roles.write().await.register(role);
        self.reflatten_all().await;
    }

    async fn reflatten_all(&self) {
        let roles = self.roles.read().await;
        let mut contexts = self.contexts.write().await;
        for context in contexts.values_mut() {
            let flat = roles.flatten(&context.roles, &context.plugin_name);
            context.resolved_roles = flat.resolved;
            context.set_role_permissions(flat.permissions);
        }
        drop(contexts);
        drop(roles);
        self.cache.write().await.clear();
    }

    /// プラグインにロールを割り当てる
    pub async fn assign_role(&self, plugin_id: &str, role: &str) -> Result<()> {
        if !self.roles.read().await.contains(role) {
            return Err(Error::NotFound(format!("role '{}'", role)));
        }
        {
            let roles = self.roles.read().await;
            let mut contexts = self.contexts.write().await;
            let context = contexts
                .get_mut(plugin_id)
                .ok_or_else(|| Error::NotFound(format!("security context for {}", plugin_id)))?;
            context.roles.insert(role.to_string());
            let flat = roles.flatten(&context.roles, &context.plugin_name);
            context.resolved_roles = flat.resolved;
            context.set_role_permissions(flat.permissions);
        }
        self.invalidate(plugin_id).await;

        self.audit
            .append(AuditEntry::new(
                AuditAction::AssignRole,
                plugin_id,
                role,
                None,
                true,
                "role assigned",
            ))
            .await;
        Ok(())
    }

    /// 信頼レベルの昇格を要求する
    ///
    /// 却下は `approved: false` の結果として返す。コンテキストがない場合のみエラー。
    #[instrument(skip(self, request), fields(plugin_id = %request.plugin_id, requested = %request.requested_level))]
    pub async fn request_escalation(&self, request: EscalationRequest) -> Result<EscalationOutcome> {
        let current = self
            .context(&request.plugin_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("security context for {}", request.plugin_id)))?;
        let previous_level = current.trust_level;

        let rejection = match self.gate.admit(&request.plugin_id).await {
            Err(reason) => Some(reason),
            Ok(()) => {
                let decision = self.approver.review(&request, previous_level).await;
                (!decision.approved).then_some(decision.reason)
            }
        };

        let outcome = match rejection {
            Some(reason) => {
                warn!("Escalation rejected: {}", reason);
                EscalationOutcome {
                    approved: false,
                    previous_level,
                    current_level: previous_level,
                    reason,
                }
            }
            None => {
                // 組み込みロールを差し替え、付与済みの権限と追加ロールは維持する
                let mut roles: BTreeSet<String> = current
                    .roles
                    .iter()
                    .filter(|r| !r.starts_with("trust:"))
                    .cloned()
                    .collect();
                roles.insert(builtin_role_name(request.requested_level));
                let rebuilt = self
                    .build_context(
                        &current.plugin_id,
                        &current.plugin_name,
                        request.requested_level,
                        roles,
                        current.grants.clone(),
                        current.revoked.clone(),
                    )
                    .await;
                self.contexts
                    .write()
                    .await
                    .insert(request.plugin_id.clone(), rebuilt);
                self.invalidate(&request.plugin_id).await;
                info!(
                    "Trust level of {} raised from {} to {}",
                    request.plugin_id, previous_level, request.requested_level
                );
                EscalationOutcome {
                    approved: true,
                    previous_level,
                    current_level: request.requested_level,
                    reason: request.justification.clone(),
                }
            }
        };

        let entry = AuditEntry::new(
            AuditAction::Escalation,
            &request.plugin_id,
            request.requested_level.as_str(),
            None,
            outcome.approved,
            outcome.reason.clone(),
        );
        self.events
            .notify(HostNotification::PermissionAudit(entry.clone()));
        self.audit.append(entry).await;
        Ok(outcome)
    }

    async fn invalidate(&self, plugin_id: &str) {
        self.cache.write().await.invalidate_plugin(plugin_id);
    }

    /// 許可された回数
    pub async fn usage_count(&self, plugin_id: &str, permission: &str) -> u64 {
        self.usage
            .read()
            .await
            .get(&(plugin_id.to_string(), permission.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub async fn search_audit(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.audit.search(query).await
    }

    pub async fn audit_statistics(&self) -> AuditStatistics {
        self.audit.statistics().await
    }

    pub async fn role_names(&self) -> Vec<String> {
        self.roles.read().await.names()
    }
}

#[async_trait]
impl CapabilityAuthorizer for PermissionManager {
    async fn authorize(
        &self,
        plugin_id: &str,
        permission: &str,
        resource: Option<&str>,
        context: &HashMap<String, Value>,
    ) -> AuthorizationDecision {
        let decision = self
            .check_permission(plugin_id, permission, resource, context)
            .await;
        AuthorizationDecision {
            granted: decision.granted,
            reason: decision.reason,
        }
    }
}
