//! Revocation List

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use super::trust_store::write_atomic;
use super::types::RevocationEntry;
use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RevocationFile {
    revocations: Vec<RevocationEntry>,
}

/// 失効した鍵の一覧
#[derive(Debug, Default)]
pub struct RevocationList {
    path: Option<PathBuf>,
    entries: HashMap<String, RevocationEntry>,
}

impl RevocationList {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// ファイルからロード（存在しなければ空）
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<RevocationFile>(&content)
                .map_err(|e| Error::TrustStore(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RevocationFile::default(),
            Err(e) => return Err(Error::TrustStore(format!("{}: {}", path.display(), e))),
        };

        info!(
            "Loaded {} revocations from {}",
            file.revocations.len(),
            path.display()
        );
        Ok(Self {
            path: Some(path),
            entries: file
                .revocations
                .into_iter()
                .map(|entry| (entry.key_id.clone(), entry))
                .collect(),
        })
    }

    pub fn is_revoked(&self, key_id: &str) -> bool {
        self.entries.contains_key(key_id)
    }

    pub fn get(&self, key_id: &str) -> Option<&RevocationEntry> {
        self.entries.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 鍵を失効させて保存。既に失効済みなら元のレコードを残す。
    pub async fn revoke(&mut self, key_id: &str, reason: &str) -> Result<RevocationEntry> {
        if let Some(existing) = self.entries.get(key_id) {
            warn!("Key {} was already revoked", key_id);
            return Ok(existing.clone());
        }

        let entry = RevocationEntry {
            key_id: key_id.to_string(),
            revocation_date: Utc::now(),
            reason: reason.to_string(),
        };
        self.entries.insert(key_id.to_string(), entry.clone());
        self.persist().await?;
        Ok(entry)
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut revocations: Vec<_> = self.entries.values().cloned().collect();
        revocations.sort_by(|a, b| a.revocation_date.cmp(&b.revocation_date));
        write_atomic(path, &serde_json::to_vec_pretty(&RevocationFile { revocations })?)
            .await
            .map_err(|e| Error::TrustStore(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revocation_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revoked.json");

        let mut list = RevocationList::load(&path).await.unwrap();
        list.revoke("key-1", "compromised").await.unwrap();
        // 二度目は元の理由を保持
        let again = list.revoke("key-1", "other").await.unwrap();
        assert_eq!(again.reason, "compromised");

        let reloaded = RevocationList::load(&path).await.unwrap();
        assert!(reloaded.is_revoked("key-1"));
        assert!(!reloaded.is_revoked("key-2"));
        assert_eq!(reloaded.len(), 1);
    }
}
