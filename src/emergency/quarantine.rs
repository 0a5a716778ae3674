//! Quarantine Registry
//!
//! プラグイン単位の隔離。明示的に解除されるまで保持する。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::types::QuarantineRecord;
use crate::error::{Error, Result};
use crate::signature::trust_store::write_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct QuarantineFile {
    #[serde(default)]
    quarantined: Vec<QuarantineRecord>,
}

/// 隔離レジストリ
#[derive(Debug, Default)]
pub struct QuarantineRegistry {
    path: Option<PathBuf>,
    records: HashMap<String, QuarantineRecord>,
}

impl QuarantineRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// ファイルから読み込む（存在しなければ空）
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: QuarantineFile = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Emergency(format!("corrupt quarantine registry {}: {}", path.display(), e))
                })?;
                file.quarantined
                    .into_iter()
                    .map(|r| (r.plugin_id.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        if !records.is_empty() {
            info!("Loaded {} quarantined plugins", records.len());
        }
        Ok(Self {
            path: Some(path),
            records,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_quarantined(&self, plugin_id: &str) -> bool {
        self.records.contains_key(plugin_id)
    }

    pub fn get(&self, plugin_id: &str) -> Option<&QuarantineRecord> {
        self.records.get(plugin_id)
    }

    /// 隔離中のプラグイン（ID順）
    pub fn list(&self) -> Vec<QuarantineRecord> {
        let mut records: Vec<QuarantineRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 隔離する。既に隔離済みなら元のレコードを保持して `false`
    ///
    /// 書き込みに失敗してもメモリ上の隔離は有効なまま。
    pub async fn insert(&mut self, record: QuarantineRecord) -> Result<bool> {
        if self.records.contains_key(&record.plugin_id) {
            return Ok(false);
        }
        self.records.insert(record.plugin_id.clone(), record);
        self.persist().await?;
        Ok(true)
    }

    /// 隔離を解除する
    pub async fn release(&mut self, plugin_id: &str) -> Result<Option<QuarantineRecord>> {
        let removed = self.records.remove(plugin_id);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = QuarantineFile {
            quarantined: self.list(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&file)?)
            .await
            .map_err(|e| Error::Emergency(format!("{}: {}", path.display(), e)))
    }
}
