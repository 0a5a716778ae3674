//! Role Registry
//!
//! ロール定義と継承の展開。継承は幅優先で辿り、処理済みセットで循環を打ち切る。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

use super::types::{Permission, PermissionScope, SecurityRole};
use crate::types::TrustLevel;

/// 組み込みスコープ内でプラグイン名に置換されるプレースホルダ
pub const PLUGIN_PLACEHOLDER: &str = "{plugin}";

/// 信頼レベルに対応する組み込みロール名
pub fn builtin_role_name(level: TrustLevel) -> String {
    format!("trust:{}", level.as_str())
}

fn own_data_dir() -> PermissionScope {
    PermissionScope::PathPattern(format!("^/plugins/{}/data/.*", PLUGIN_PLACEHOLDER))
}

/// 組み込みロール
pub fn builtin_roles() -> Vec<SecurityRole> {
    vec![
        SecurityRole::new(builtin_role_name(TrustLevel::Untrusted), "Logging only")
            .with_permission(Permission::allow("log", PermissionScope::Global)),
        SecurityRole::new(builtin_role_name(TrustLevel::Basic), "Own key-value storage")
            .inheriting(builtin_role_name(TrustLevel::Untrusted))
            .with_permission(Permission::allow("storage.read", PermissionScope::Global))
            .with_permission(Permission::allow("storage.write", PermissionScope::Global)),
        SecurityRole::new(builtin_role_name(TrustLevel::Verified), "Read own data directory")
            .inheriting(builtin_role_name(TrustLevel::Basic))
            .with_permission(Permission::allow("fs.read", own_data_dir())),
        SecurityRole::new(
            builtin_role_name(TrustLevel::Trusted),
            "Write own data directory and make HTTP requests",
        )
        .inheriting(builtin_role_name(TrustLevel::Verified))
        .with_permission(Permission::allow("fs.write", own_data_dir()))
        .with_permission(Permission::allow("network.http", PermissionScope::Global)),
        SecurityRole::new(builtin_role_name(TrustLevel::System), "Unrestricted")
            .with_permission(Permission::allow("*", PermissionScope::Global)),
    ]
}

/// 展開結果
#[derive(Debug, Default)]
pub struct FlattenedRoles {
    pub permissions: Vec<Permission>,
    /// 実際に見つかったロール
    pub resolved: BTreeSet<String>,
    /// 未登録のロール名
    pub missing: Vec<String>,
}

/// ロールの登録簿
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    roles: HashMap<String, SecurityRole>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl RoleRegistry {
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for role in builtin_roles() {
            registry.register(role);
        }
        registry
    }

    /// 登録または置換
    pub fn register(&mut self, role: SecurityRole) -> Option<SecurityRole> {
        self.roles.insert(role.name.clone(), role)
    }

    pub fn get(&self, name: &str) -> Option<&SecurityRole> {
        self.roles.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.roles.keys().cloned().collect();
        names.sort();
        names
    }

    /// ロールを継承込みで展開し、`{plugin}` を置換する
    pub fn flatten<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a String>,
        plugin_name: &str,
    ) -> FlattenedRoles {
        let mut result = FlattenedRoles::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(role) = self.roles.get(&name) else {
                debug!("Role '{}' is not registered; skipping", name);
                result.missing.push(name);
                continue;
            };
            result.resolved.insert(name);
            result.permissions.extend(
                role.permissions
                    .iter()
                    .map(|permission| substitute_plugin(permission, plugin_name)),
            );
            for parent in &role.inherits {
                if !visited.contains(parent) {
                    queue.push_back(parent.clone());
                }
            }
        }
        result
    }
}

fn substitute_plugin(permission: &Permission, plugin_name: &str) -> Permission {
    let mut permission = permission.clone();
    permission.scope = match permission.scope {
        PermissionScope::PathPattern(pattern) => PermissionScope::PathPattern(
            pattern.replace(PLUGIN_PLACEHOLDER, &regex::escape(plugin_name)),
        ),
        PermissionScope::Plugin(name) => {
            PermissionScope::Plugin(name.replace(PLUGIN_PLACEHOLDER, plugin_name))
        }
        other => other,
    };
    permission
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_inheritance() {
        let registry = RoleRegistry::with_builtins();
        let roots = vec![builtin_role_name(TrustLevel::Trusted)];
        let flat = registry.flatten(&roots, "notes");

        let types: BTreeSet<_> = flat
            .permissions
            .iter()
            .map(|p| p.permission_type.as_str())
            .collect();
        for expected in ["log", "storage.read", "storage.write", "fs.read", "fs.write", "network.http"] {
            assert!(types.contains(expected), "missing {}", expected);
        }
        assert_eq!(flat.resolved.len(), 4);
        assert!(flat.permissions.iter().any(|p| p.scope
            == PermissionScope::PathPattern("^/plugins/notes/data/.*".to_string())));
    }

    #[test]
    fn test_cycles_terminate() {
        let mut registry = RoleRegistry::empty();
        registry.register(
            SecurityRole::new("a", "")
                .inheriting("b")
                .with_permission(Permission::allow("x", PermissionScope::Global)),
        );
        registry.register(
            SecurityRole::new("b", "")
                .inheriting("c")
                .with_permission(Permission::allow("y", PermissionScope::Global)),
        );
        registry.register(SecurityRole::new("c", "").inheriting("a").inheriting("ghost"));

        let flat = registry.flatten(&vec!["a".to_string()], "p");
        assert_eq!(flat.permissions.len(), 2);
        assert_eq!(flat.resolved.len(), 3);
        assert_eq!(flat.missing, vec!["ghost".to_string()]);
    }
}
