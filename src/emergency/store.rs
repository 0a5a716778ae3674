//! Incident Store
//!
//! インシデントをメモリに保持し、ディレクトリが設定されていれば
//! 追記専用の `incidents.log` と `incident-<id>.json` に書き出す。

use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{EmergencyIncident, ForensicArtifact};
use crate::error::{Error, Result};
use crate::signature::trust_store::write_atomic;

const LOG_FILE: &str = "incidents.log";
const RECORD_PREFIX: &str = "incident-";

/// インシデントの保存先
pub struct IncidentStore {
    dir: Option<PathBuf>,
    max_in_memory: usize,
    incidents: RwLock<VecDeque<EmergencyIncident>>,
    total: RwLock<u64>,
    writer: Mutex<()>,
}

impl IncidentStore {
    pub fn in_memory(max_in_memory: usize) -> Self {
        Self {
            dir: None,
            max_in_memory: max_in_memory.max(1),
            incidents: RwLock::new(VecDeque::new()),
            total: RwLock::new(0),
            writer: Mutex::new(()),
        }
    }

    /// ディレクトリを開き、既存のレコードを新しい順に読み込む
    pub async fn open(dir: impl Into<PathBuf>, max_in_memory: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut loaded = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_record(&path) {
                continue;
            }
            match read_record(&path).await {
                Ok(incident) => loaded.push(incident),
                Err(e) => warn!("Skipping unreadable incident record {}: {}", path.display(), e),
            }
        }
        loaded.sort_by_key(|i| i.created_at);

        let total = loaded.len() as u64;
        let skip = loaded.len().saturating_sub(max_in_memory.max(1));
        let incidents: VecDeque<EmergencyIncident> = loaded.into_iter().skip(skip).collect();
        info!(
            "Loaded {} incident records from {}",
            incidents.len(),
            dir.display()
        );

        Ok(Self {
            dir: Some(dir),
            max_in_memory: max_in_memory.max(1),
            incidents: RwLock::new(incidents),
            total: RwLock::new(total),
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// インシデントを記録する（メモリへの追加はディスク書き込みの成否に関わらず行う）
    pub async fn record(&self, incident: EmergencyIncident) -> Result<()> {
        {
            let mut incidents = self.incidents.write().await;
            incidents.push_back(incident.clone());
            while incidents.len() > self.max_in_memory {
                incidents.pop_front();
            }
        }
        *self.total.write().await += 1;

        let Some(dir) = &self.dir else {
            return Ok(());
        };
        self.append_log(dir, &incident).await?;
        write_record(dir, &incident).await?;
        debug!(incident_id = %incident.id, "Incident persisted");
        Ok(())
    }

    /// フォレンジック情報を追加する（インシデントで変更できる唯一の項目）
    pub async fn attach_forensics(
        &self,
        incident_id: Uuid,
        artifacts: Vec<ForensicArtifact>,
    ) -> Result<()> {
        let updated = {
            let mut incidents = self.incidents.write().await;
            let incident = incidents
                .iter_mut()
                .find(|i| i.id == incident_id)
                .ok_or_else(|| Error::NotFound(format!("incident {}", incident_id)))?;
            incident.forensics.extend(artifacts);
            incident.clone()
        };
        if let Some(dir) = &self.dir {
            write_record(dir, &updated).await?;
        }
        Ok(())
    }

    pub async fn get(&self, incident_id: Uuid) -> Option<EmergencyIncident> {
        self.incidents
            .read()
            .await
            .iter()
            .find(|i| i.id == incident_id)
            .cloned()
    }

    /// メモリ上のインシデント（新しい順）
    pub async fn list(&self, limit: usize) -> Vec<EmergencyIncident> {
        self.incidents
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn for_plugin(&self, plugin_id: &str) -> Vec<EmergencyIncident> {
        self.incidents
            .read()
            .await
            .iter()
            .filter(|i| i.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    /// 起動以降と読み込み済みを合わせた件数
    pub async fn count(&self) -> u64 {
        *self.total.read().await
    }

    /// 保持期間を過ぎたレコードファイルを削除する
    ///
    /// `incidents.log` には触れない。
    pub async fn apply_retention(&self, days: u32) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let cutoff = Utc::now() - Duration::days(days as i64);

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_record(&path) {
                continue;
            }
            let expired = match read_record(&path).await {
                Ok(incident) => incident.created_at < cutoff,
                Err(e) => {
                    warn!("Cannot read incident record {}: {}", path.display(), e);
                    false
                }
            };
            if expired {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} incident records older than {} days", removed, days);
        }
        Ok(removed)
    }

    async fn append_log(&self, dir: &Path, incident: &EmergencyIncident) -> Result<()> {
        let actions: Vec<String> = incident
            .actions
            .iter()
            .map(|a| {
                if a.success {
                    a.action.to_string()
                } else {
                    format!("{}!", a.action)
                }
            })
            .collect();
        let line = format!(
            "{} [{}] incident={} execution={} plugin={} trigger={} state={:?} actions={}\n",
            incident.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            incident.severity.as_str().to_uppercase(),
            incident.id,
            incident.execution_id,
            incident.plugin_id,
            incident.trigger,
            incident.final_state,
            actions.join(",")
        );

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn record_path(dir: &Path, incident_id: Uuid) -> PathBuf {
    dir.join(format!("{}{}.json", RECORD_PREFIX, incident_id))
}

fn is_record(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(RECORD_PREFIX))
}

async fn write_record(dir: &Path, incident: &EmergencyIncident) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(incident)?;
    write_atomic(&record_path(dir, incident.id), &bytes).await?;
    Ok(())
}

async fn read_record(path: &Path) -> Result<EmergencyIncident> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::types::{
        ActionOutcome, EmergencyAction, EmergencyState, EmergencyTrigger,
    };
    use crate::types::Severity;
    use serde_json::json;

    fn incident(age_days: i64) -> EmergencyIncident {
        EmergencyIncident {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            plugin_id: "p@1.0.0".to_string(),
            trigger: EmergencyTrigger::InfiniteLoop,
            severity: Severity::Critical,
            description: "test".to_string(),
            created_at: Utc::now() - Duration::days(age_days),
            actions: vec![ActionOutcome {
                action: EmergencyAction::Terminate,
                success: true,
                message: "terminated".to_string(),
                duration_ms: 1,
            }],
            final_state: EmergencyState::Resolved,
            forensics: Vec::new(),
            backup_path: None,
        }
    }

    #[tokio::test]
    async fn test_record_persists_log_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = IncidentStore::open(dir.path(), 10).await.unwrap();
        let first = incident(0);
        store.record(first.clone()).await.unwrap();
        store.record(incident(0)).await.unwrap();

        let log = tokio::fs::read_to_string(dir.path().join(LOG_FILE)).await.unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains(&first.id.to_string()));

        // 再読み込みで復元される
        let reopened = IncidentStore::open(dir.path(), 10).await.unwrap();
        assert_eq!(reopened.count().await, 2);
        assert_eq!(reopened.get(first.id).await.unwrap().plugin_id, "p@1.0.0");
    }

    #[tokio::test]
    async fn test_retention_keeps_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = IncidentStore::open(dir.path(), 10).await.unwrap();
        let old = incident(400);
        let recent = incident(1);
        store.record(old.clone()).await.unwrap();
        store.record(recent.clone()).await.unwrap();

        assert_eq!(store.apply_retention(365).await.unwrap(), 1);
        assert!(!record_path(dir.path(), old.id).exists());
        assert!(record_path(dir.path(), recent.id).exists());

        let log = tokio::fs::read_to_string(dir.path().join(LOG_FILE)).await.unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_attach_forensics_and_memory_bound() {
        let store = IncidentStore::in_memory(2);
        let first = incident(0);
        store.record(first.clone()).await.unwrap();
        store
            .attach_forensics(
                first.id,
                vec![ForensicArtifact {
                    source: "test".to_string(),
                    collected_at: Utc::now(),
                    data: json!({"k": 1}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(store.get(first.id).await.unwrap().forensics.len(), 1);

        store.record(incident(0)).await.unwrap();
        store.record(incident(0)).await.unwrap();
        assert!(store.get(first.id).await.is_none());
        assert_eq!(store.list(10).await.len(), 2);
        assert_eq!(store.count().await, 3);
    }
}
