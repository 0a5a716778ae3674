//! Permission Audit Log
//!
//! 追記専用。メモリ上は上限件数まで保持し、設定があれば JSON Lines ファイルにも追記する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use super::types::{AuditAction, AuditEntry};

/// 監査ログの検索条件
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub plugin_id: Option<String>,
    pub permission: Option<String>,
    pub action: Option<AuditAction>,
    pub granted: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    /// 新しいものから最大件数
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.plugin_id.as_ref().map_or(true, |p| &entry.plugin_id == p)
            && self.permission.as_ref().map_or(true, |p| &entry.permission == p)
            && self.action.map_or(true, |a| entry.action == a)
            && self.granted.map_or(true, |g| entry.granted == g)
            && self.since.map_or(true, |s| entry.timestamp >= s)
    }
}

/// 監査統計
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatistics {
    pub total: u64,
    pub granted: u64,
    pub denied: u64,
    pub by_permission: HashMap<String, u64>,
    pub denied_by_plugin: HashMap<String, u64>,
}

/// 監査ログ
pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    max_entries: usize,
    statistics: RwLock<AuditStatistics>,
    file: Option<PathBuf>,
    // ファイルへの追記は直列化する
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(max_entries: usize, file: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            max_entries,
            statistics: RwLock::new(AuditStatistics::default()),
            file,
            writer: Mutex::new(()),
        }
    }

    /// エントリを追記
    ///
    /// ファイル書き込みの失敗は警告ログのみ（メモリ上の記録は残る）。
    pub async fn append(&self, entry: AuditEntry) {
        {
            let mut stats = self.statistics.write().await;
            stats.total += 1;
            if entry.granted {
                stats.granted += 1;
            } else {
                stats.denied += 1;
                *stats
                    .denied_by_plugin
                    .entry(entry.plugin_id.clone())
                    .or_insert(0) += 1;
            }
            *stats
                .by_permission
                .entry(entry.permission.clone())
                .or_insert(0) += 1;
        }

        if let Some(path) = &self.file {
            if let Err(e) = self.write_line(path, &entry).await {
                warn!("Failed to append audit entry to {}: {}", path.display(), e);
            }
        }

        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    async fn write_line(&self, path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    /// 条件に合うエントリ（新しい順）
    pub async fn search(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        entries
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 起動以降の累計統計
    pub async fn statistics(&self) -> AuditStatistics {
        self.statistics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_search_and_bound() {
        let log = AuditLog::new(3, None);
        for i in 0..5 {
            log.append(AuditEntry::new(
                AuditAction::Check,
                "p@1.0.0",
                "fs.read",
                Some(&format!("/plugins/p/data/{}", i)),
                i % 2 == 0,
                "test",
            ))
            .await;
        }
        assert_eq!(log.len().await, 3);

        let denied = log
            .search(&AuditQuery {
                granted: Some(false),
                ..Default::default()
            })
            .await;
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].resource.as_deref(), Some("/plugins/p/data/3"));

        let stats = log.statistics().await;
        assert_eq!(stats.total, 5);
        assert_eq!(stats.denied, 2);
        assert_eq!(stats.by_permission["fs.read"], 5);
    }

    #[tokio::test]
    async fn test_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(10, Some(path.clone()));
        log.append(AuditEntry::new(AuditAction::Grant, "p@1", "log", None, true, "ok"))
            .await;
        log.append(AuditEntry::new(AuditAction::Check, "p@1", "fs.write", None, false, "no"))
            .await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.permission, "fs.write");
        assert!(!parsed.granted);
    }
}
