//! Trust Store
//!
//! 鍵ID → 信頼済み発行者。更新のたびにファイル全体を書き直す（一時ファイル経由で置き換え）。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::types::TrustedPublisher;
use crate::error::{Error, Result};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct TrustStoreFile {
    version: u32,
    publishers: Vec<TrustedPublisher>,
}

/// 信頼済み発行者のストア
#[derive(Debug, Default)]
pub struct TrustStore {
    path: Option<PathBuf>,
    publishers: HashMap<String, TrustedPublisher>,
}

impl TrustStore {
    /// メモリ上のみのストア
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// ファイルからロード（存在しなければ空）
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let publishers = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: TrustStoreFile = serde_json::from_str(&content).map_err(|e| {
                    Error::TrustStore(format!("{}: {}", path.display(), e))
                })?;
                if file.version != STORE_VERSION {
                    return Err(Error::TrustStore(format!(
                        "{}: unsupported version {}",
                        path.display(),
                        file.version
                    )));
                }
                file.publishers
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::TrustStore(format!("{}: {}", path.display(), e)));
            }
        };

        info!(
            "Loaded {} trusted publishers from {}",
            publishers.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path),
            publishers: publishers
                .into_iter()
                .map(|p| (p.key_id.clone(), p))
                .collect(),
        })
    }

    /// 発行者を取得
    pub fn get(&self, key_id: &str) -> Option<&TrustedPublisher> {
        self.publishers.get(key_id)
    }

    /// 全発行者（鍵ID順）
    pub fn list(&self) -> Vec<TrustedPublisher> {
        let mut publishers: Vec<_> = self.publishers.values().cloned().collect();
        publishers.sort_by(|a, b| a.key_id.cmp(&b.key_id));
        publishers
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    /// 発行者を追加または置換して保存
    pub async fn upsert(&mut self, publisher: TrustedPublisher) -> Result<()> {
        debug!("Upserting publisher {}", publisher.key_id);
        self.publishers.insert(publisher.key_id.clone(), publisher);
        self.persist().await
    }

    /// 発行者を削除して保存
    pub async fn remove(&mut self, key_id: &str) -> Result<Option<TrustedPublisher>> {
        let removed = self.publishers.remove(key_id);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// 失効フラグを立てて保存
    pub async fn mark_revoked(&mut self, key_id: &str) -> Result<bool> {
        match self.publishers.get_mut(key_id) {
            Some(publisher) if !publisher.revoked => {
                publisher.revoked = true;
                self.persist().await?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = TrustStoreFile {
            version: STORE_VERSION,
            publishers: self.list(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&file)?)
            .await
            .map_err(|e| Error::TrustStore(format!("{}: {}", path.display(), e)))
    }
}

/// 一時ファイルに書いてから置き換える
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
