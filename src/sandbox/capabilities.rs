//! Mediated Capabilities
//!
//! プラグインコードから到達できる唯一のホスト機能（log / storage / fs）。
//! すべての呼び出しは権限チェック（監査付き）を経てホスト側で実行される。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::handle::ExecutionHandle;
use super::limits::ExecutionLimits;
use crate::config::SandboxConfig;
use crate::events::{EventSink, SecurityEvent, SecurityEventType};
use crate::types::Severity;

/// 仲介API呼び出し
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CapabilityRequest {
    Log { level: String, message: String },
    StorageGet { key: String },
    StorageSet { key: String, value: Value },
    StorageDelete { key: String },
    FsReadFile { path: String },
    FsWriteFile { path: String, content: String },
    FsExists { path: String },
}

impl CapabilityRequest {
    /// 必要な権限タイプ
    pub fn permission(&self) -> &'static str {
        match self {
            CapabilityRequest::Log { .. } => "log",
            CapabilityRequest::StorageGet { .. } => "storage.read",
            CapabilityRequest::StorageSet { .. } | CapabilityRequest::StorageDelete { .. } => {
                "storage.write"
            }
            CapabilityRequest::FsReadFile { .. } | CapabilityRequest::FsExists { .. } => "fs.read",
            CapabilityRequest::FsWriteFile { .. } => "fs.write",
        }
    }

    /// 操作名
    pub fn operation(&self) -> &'static str {
        match self {
            CapabilityRequest::Log { .. } => "log",
            CapabilityRequest::StorageGet { .. } => "storage.get",
            CapabilityRequest::StorageSet { .. } => "storage.set",
            CapabilityRequest::StorageDelete { .. } => "storage.delete",
            CapabilityRequest::FsReadFile { .. } => "fs.readFile",
            CapabilityRequest::FsWriteFile { .. } => "fs.writeFile",
            CapabilityRequest::FsExists { .. } => "fs.exists",
        }
    }

    /// 書き込み系か
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            CapabilityRequest::StorageSet { .. }
                | CapabilityRequest::StorageDelete { .. }
                | CapabilityRequest::FsWriteFile { .. }
        )
    }

    fn event_type(&self) -> SecurityEventType {
        match self {
            CapabilityRequest::Log { .. } => SecurityEventType::Log,
            CapabilityRequest::StorageGet { .. }
            | CapabilityRequest::StorageSet { .. }
            | CapabilityRequest::StorageDelete { .. } => SecurityEventType::StorageAccess,
            CapabilityRequest::FsReadFile { .. }
            | CapabilityRequest::FsWriteFile { .. }
            | CapabilityRequest::FsExists { .. } => SecurityEventType::FileAccess,
        }
    }
}

/// 仲介API呼び出しの失敗
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityError {
    /// ポリシーによる拒否
    Denied(String),
    /// 不正な引数
    Invalid(String),
    /// ホスト側の処理失敗
    Failed(String),
    /// 実行が終了している
    Terminated,
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityError::Denied(reason) => write!(f, "capability denied: {}", reason),
            CapabilityError::Invalid(reason) => write!(f, "invalid capability call: {}", reason),
            CapabilityError::Failed(reason) => write!(f, "capability failed: {}", reason),
            CapabilityError::Terminated => f.write_str("execution terminated"),
        }
    }
}

/// 仲介API呼び出しの応答
pub type CapabilityReply = Result<Value, CapabilityError>;

/// 隔離スレッドからホストへの呼び出し
pub struct CapabilityCall {
    pub request: CapabilityRequest,
    pub reply: oneshot::Sender<CapabilityReply>,
}

/// 認可判定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub granted: bool,
    pub reason: String,
}

impl AuthorizationDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: reason.into(),
        }
    }
}

/// 仲介APIの認可
#[async_trait]
pub trait CapabilityAuthorizer: Send + Sync {
    /// 権限をチェック（判定は監査される）
    async fn authorize(
        &self,
        plugin_id: &str,
        permission: &str,
        resource: Option<&str>,
        context: &HashMap<String, Value>,
    ) -> AuthorizationDecision;
}

/// すべて拒否する認可
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAllAuthorizer;

#[async_trait]
impl CapabilityAuthorizer for DenyAllAuthorizer {
    async fn authorize(
        &self,
        _plugin_id: &str,
        permission: &str,
        _resource: Option<&str>,
        _context: &HashMap<String, Value>,
    ) -> AuthorizationDecision {
        AuthorizationDecision::deny(format!("no authorizer configured for {}", permission))
    }
}

/// プラグイン相対パスを解決する
///
/// 字句的に正規化し、`<root>/<plugin>/data` の外に出るパスは拒否する。
/// 戻り値は（実パス, 権限チェック用の仮想パス）。
pub fn resolve_plugin_path(
    fs_root: &Path,
    plugin_name: &str,
    requested: &str,
) -> Result<(PathBuf, String), CapabilityError> {
    if requested.is_empty() || requested.contains('\0') {
        return Err(CapabilityError::Invalid("empty or malformed path".to_string()));
    }

    let virtual_prefix = format!("/plugins/{}/data", plugin_name);
    // 仮想パス表記（/plugins/<name>/data/...）も受け付ける
    let relative = requested
        .strip_prefix(&virtual_prefix)
        .unwrap_or(requested);

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    CapabilityError::Invalid("path is not valid UTF-8".to_string())
                })?;
                parts.push(part.to_string());
            }
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(CapabilityError::Denied(format!(
                        "path '{}' escapes the plugin data directory",
                        requested
                    )));
                }
            }
            Component::Prefix(_) => {
                return Err(CapabilityError::Denied(format!(
                    "path '{}' is not plugin-relative",
                    requested
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(CapabilityError::Invalid(format!(
            "path '{}' does not name a file",
            requested
        )));
    }

    let mut real = fs_root.join(plugin_name).join("data");
    for part in &parts {
        real.push(part);
    }
    let virtual_path = format!("{}/{}", virtual_prefix, parts.join("/"));
    Ok((real, virtual_path))
}

fn value_size(key: &str, value: &Value) -> u64 {
    (key.len() + serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)) as u64
}

/// ホスト側の仲介API実装
pub struct CapabilityBroker {
    config: SandboxConfig,
    authorizer: Arc<dyn CapabilityAuthorizer>,
    events: Arc<dyn EventSink>,
    /// プラグイン名 → キー → 値
    storage: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl CapabilityBroker {
    pub fn new(
        config: SandboxConfig,
        authorizer: Arc<dyn CapabilityAuthorizer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            authorizer,
            events,
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// プラグインのストレージ使用量（バイト）
    pub async fn storage_bytes(&self, plugin_name: &str) -> u64 {
        self.storage
            .read()
            .await
            .get(plugin_name)
            .map(|entries| entries.iter().map(|(k, v)| value_size(k, v)).sum())
            .unwrap_or(0)
    }

    /// プラグインのストレージのスナップショット
    pub async fn storage_snapshot(&self, plugin_name: &str) -> Option<Value> {
        self.storage
            .read()
            .await
            .get(plugin_name)
            .map(|entries| json!(entries))
    }

    fn emit(&self, handle: &ExecutionHandle, event_type: SecurityEventType, severity: Severity) -> SecurityEvent {
        SecurityEvent::new(
            event_type,
            severity,
            handle.execution_id,
            handle.plugin_id.clone(),
        )
    }

    fn deny(
        &self,
        handle: &ExecutionHandle,
        request: &CapabilityRequest,
        event_type: SecurityEventType,
        severity: Severity,
        reason: String,
    ) -> CapabilityReply {
        warn!(
            execution_id = %handle.execution_id,
            plugin = %handle.plugin_id,
            "Capability {} denied: {}",
            request.operation(),
            reason
        );
        self.events.emit(
            self.emit(handle, event_type, severity)
                .with_metadata("capability", request.operation())
                .with_metadata("permission", request.permission())
                .with_metadata("reason", reason.clone()),
        );
        Err(CapabilityError::Denied(reason))
    }

    /// 呼び出しを処理
    pub async fn handle(
        &self,
        handle: &ExecutionHandle,
        limits: &ExecutionLimits,
        request: CapabilityRequest,
    ) -> CapabilityReply {
        if handle.is_cancelled() {
            return Err(CapabilityError::Terminated);
        }

        if handle.is_isolated() {
            return self.deny(
                handle,
                &request,
                SecurityEventType::CapabilityDenied,
                Severity::High,
                "execution is isolated".to_string(),
            );
        }
        if handle.is_restricted() && request.is_write() {
            return self.deny(
                handle,
                &request,
                SecurityEventType::CapabilityDenied,
                Severity::Medium,
                "execution is restricted to read-only capabilities".to_string(),
            );
        }

        // パス解決は権限チェックより前に行う
        let resolved = match &request {
            CapabilityRequest::FsReadFile { path }
            | CapabilityRequest::FsWriteFile { path, .. }
            | CapabilityRequest::FsExists { path } => {
                match resolve_plugin_path(&self.config.fs_root, &handle.plugin_name, path) {
                    Ok(resolved) => Some(resolved),
                    Err(CapabilityError::Denied(reason)) => {
                        return self.deny(
                            handle,
                            &request,
                            SecurityEventType::CapabilityDenied,
                            Severity::High,
                            reason,
                        );
                    }
                    Err(other) => return Err(other),
                }
            }
            _ => None,
        };

        let resource = match (&request, &resolved) {
            (_, Some((_, virtual_path))) => Some(virtual_path.clone()),
            (CapabilityRequest::StorageGet { key }, _)
            | (CapabilityRequest::StorageSet { key, .. }, _)
            | (CapabilityRequest::StorageDelete { key }, _) => Some(key.clone()),
            _ => None,
        };

        let mut context = HashMap::new();
        context.insert(
            "execution_id".to_string(),
            Value::String(handle.execution_id.to_string()),
        );
        context.insert(
            "capability".to_string(),
            Value::String(request.operation().to_string()),
        );

        let decision = self
            .authorizer
            .authorize(
                &handle.plugin_id,
                request.permission(),
                resource.as_deref(),
                &context,
            )
            .await;
        if !decision.granted {
            return self.deny(
                handle,
                &request,
                SecurityEventType::PermissionDenied,
                Severity::Medium,
                decision.reason,
            );
        }

        let event_type = request.event_type();
        let operation = request.operation();
        let result = match request {
            CapabilityRequest::Log { level, message } => self.log(handle, &level, &message),
            CapabilityRequest::StorageGet { key } => self.storage_get(handle, &key).await,
            CapabilityRequest::StorageSet { key, value } => {
                self.storage_set(handle, limits, key, value).await
            }
            CapabilityRequest::StorageDelete { key } => self.storage_delete(handle, &key).await,
            CapabilityRequest::FsReadFile { .. } => match &resolved {
                Some((real, _)) => self.fs_read(handle, limits, real).await,
                None => Err(CapabilityError::Invalid("unresolved path".to_string())),
            },
            CapabilityRequest::FsWriteFile { content, .. } => match &resolved {
                Some((real, _)) => self.fs_write(handle, limits, real, content).await,
                None => Err(CapabilityError::Invalid("unresolved path".to_string())),
            },
            CapabilityRequest::FsExists { .. } => match &resolved {
                Some((real, _)) => Ok(Value::Bool(tokio::fs::try_exists(real).await.unwrap_or(false))),
                None => Err(CapabilityError::Invalid("unresolved path".to_string())),
            },
        };

        if event_type != SecurityEventType::Log {
            let mut event = self
                .emit(handle, event_type, Severity::Info)
                .with_metadata("capability", operation)
                .with_metadata("success", result.is_ok());
            if let Some(resource) = resource {
                event = event.with_metadata("resource", resource);
            }
            self.events.emit(event);
        }

        result
    }

    fn log(&self, handle: &ExecutionHandle, level: &str, message: &str) -> CapabilityReply {
        let plugin = handle.plugin_id.as_str();
        match level {
            "trace" => trace!(target: "plugin", plugin, "{}", message),
            "debug" => debug!(target: "plugin", plugin, "{}", message),
            "info" => info!(target: "plugin", plugin, "{}", message),
            "warn" => warn!(target: "plugin", plugin, "{}", message),
            "error" => error!(target: "plugin", plugin, "{}", message),
            other => {
                return Err(CapabilityError::Invalid(format!(
                    "unknown log level '{}'",
                    other
                )))
            }
        }
        Ok(Value::Null)
    }

    async fn storage_get(&self, handle: &ExecutionHandle, key: &str) -> CapabilityReply {
        let storage = self.storage.read().await;
        let value = storage
            .get(&handle.plugin_name)
            .and_then(|entries| entries.get(key))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(value)
    }

    async fn storage_set(
        &self,
        handle: &ExecutionHandle,
        limits: &ExecutionLimits,
        key: String,
        value: Value,
    ) -> CapabilityReply {
        if key.is_empty() {
            return Err(CapabilityError::Invalid("empty storage key".to_string()));
        }

        let mut storage = self.storage.write().await;
        let entries = storage.entry(handle.plugin_name.clone()).or_default();

        if !entries.contains_key(&key) && entries.len() >= limits.max_storage_entries {
            return Err(CapabilityError::Denied(format!(
                "storage is limited to {} keys",
                limits.max_storage_entries
            )));
        }

        let current: u64 = entries.iter().map(|(k, v)| value_size(k, v)).sum();
        let replaced = entries.get(&key).map(|v| value_size(&key, v)).unwrap_or(0);
        let projected = current - replaced + value_size(&key, &value);

        if projected > limits.max_memory_bytes {
            // メモリ上限超過は強制終了
            handle.set_heap_bytes(projected);
            handle.terminate(super::handle::TerminationReason::MemoryLimit);
            return Err(CapabilityError::Terminated);
        }

        entries.insert(key, value);
        handle.set_heap_bytes(projected);
        Ok(Value::Null)
    }

    async fn storage_delete(&self, handle: &ExecutionHandle, key: &str) -> CapabilityReply {
        let mut storage = self.storage.write().await;
        let Some(entries) = storage.get_mut(&handle.plugin_name) else {
            return Ok(Value::Bool(false));
        };
        let removed = entries.remove(key).is_some();
        let remaining: u64 = entries.iter().map(|(k, v)| value_size(k, v)).sum();
        handle.set_heap_bytes(remaining);
        Ok(Value::Bool(removed))
    }

    async fn fs_read(
        &self,
        handle: &ExecutionHandle,
        limits: &ExecutionLimits,
        path: &Path,
    ) -> CapabilityReply {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| CapabilityError::Failed(e.to_string()))?;
        if metadata.len() > limits.max_file_bytes {
            return Err(CapabilityError::Denied(format!(
                "file is {} bytes, larger than {}",
                metadata.len(),
                limits.max_file_bytes
            )));
        }

        handle.set_external_bytes(metadata.len());
        let content = tokio::fs::read_to_string(path).await;
        handle.set_external_bytes(0);

        let content = content.map_err(|e| CapabilityError::Failed(e.to_string()))?;
        handle.record_read(content.len() as u64);
        Ok(Value::String(content))
    }

    async fn fs_write(
        &self,
        handle: &ExecutionHandle,
        limits: &ExecutionLimits,
        path: &Path,
        content: String,
    ) -> CapabilityReply {
        let size = content.len() as u64;
        if size > limits.max_file_bytes {
            return Err(CapabilityError::Denied(format!(
                "content is {} bytes, larger than {}",
                size, limits.max_file_bytes
            )));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CapabilityError::Failed(e.to_string()))?;
        }

        handle.set_external_bytes(size);
        let written = tokio::fs::write(path, content.as_bytes()).await;
        handle.set_external_bytes(0);

        written.map_err(|e| CapabilityError::Failed(e.to_string()))?;
        handle.record_write(size);
        Ok(Value::Null)
    }
}
