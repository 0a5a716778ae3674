//! Plugin Model
//!
//! ロード済みプラグイン（マニフェスト＋ソース）。ロード後は不変で、更新時は別インスタンスに置き換える。

pub mod manifest;

pub use manifest::{DeclaredPermission, PluginManifest, DEFAULT_MAIN};

use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};

/// ソースコードの上限サイズ（ロード時）
const MAX_SOURCE_BYTES: u64 = 4 * 1024 * 1024;

/// ロード済みプラグイン
#[derive(Debug, Clone)]
pub struct Plugin {
    manifest: Arc<PluginManifest>,
    source: Arc<str>,
}

impl Plugin {
    /// マニフェストとソースから作成
    pub fn new(manifest: PluginManifest, source: impl Into<String>) -> Result<Self> {
        manifest.validate()?;
        Ok(Self {
            manifest: Arc::new(manifest),
            source: Arc::from(source.into()),
        })
    }

    /// ディレクトリからロード（`plugin.json` または `plugin.toml`）
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let json_path = dir.join("plugin.json");
        let toml_path = dir.join("plugin.toml");

        let manifest = if json_path.is_file() {
            PluginManifest::from_json(&std::fs::read_to_string(&json_path)?)?
        } else if toml_path.is_file() {
            PluginManifest::from_toml(&std::fs::read_to_string(&toml_path)?)?
        } else {
            return Err(Error::InvalidManifest(format!(
                "no plugin.json or plugin.toml in {}",
                dir.display()
            )));
        };

        let main_path = dir.join(manifest.main_file());
        let size = std::fs::metadata(&main_path)?.len();
        if size > MAX_SOURCE_BYTES {
            return Err(Error::InvalidInput(format!(
                "{} is {} bytes, larger than {}",
                main_path.display(),
                size,
                MAX_SOURCE_BYTES
            )));
        }
        let source = std::fs::read_to_string(&main_path)?;

        debug!(
            "Loaded plugin {} from {}",
            manifest.plugin_id(),
            dir.display()
        );
        Self::new(manifest, source)
    }

    /// マニフェスト
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// ソースコード
    pub fn source(&self) -> &str {
        &self.source
    }

    /// プラグイン名
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// `name@version`
    pub fn id(&self) -> String {
        self.manifest.plugin_id()
    }

    /// ソースコードのSHA-256（hex）
    pub fn source_hash(&self) -> String {
        content_hash(&self.source)
    }

    /// 宣言された識別情報とコードから決定的なフィンガープリントを計算
    pub fn fingerprint(&self) -> String {
        let mut entry_points = self.manifest.entry_points.clone();
        entry_points.sort();
        let mut permissions: Vec<String> = self
            .manifest
            .permissions
            .iter()
            .map(|p| match &p.resource {
                Some(resource) => format!("{}:{}", p.permission, resource),
                None => p.permission.clone(),
            })
            .collect();
        permissions.sort();

        // serde_json::Map はキー順に並ぶため、この表現は正規形になる
        let identity = json!({
            "name": self.manifest.name,
            "version": self.manifest.version.to_string(),
            "author": self.manifest.author,
            "main": self.manifest.main_file(),
            "entryPoints": entry_points,
            "permissions": permissions,
        });

        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.source_hash().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// 文字列のSHA-256（hex）
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str) -> PluginManifest {
        PluginManifest::from_json(&format!(
            r#"{{"name":"{}","version":"1.0.0","description":"test","entryPoints":["run"]}}"#,
            name
        ))
        .unwrap()
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Plugin::new(manifest("demo"), "fn run() { 1 }").unwrap();
        let b = Plugin::new(manifest("demo"), "fn run() { 1 }").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_code() {
        let a = Plugin::new(manifest("demo"), "fn run() { 1 }").unwrap();
        let b = Plugin::new(manifest("demo"), "fn run() { 2 }").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            r#"{"name":"loader","version":"0.2.0","description":"d","entryPoints":["run"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("main.rhai"), "fn run() { 42 }").unwrap();

        let plugin = Plugin::load(dir.path()).unwrap();
        assert_eq!(plugin.id(), "loader@0.2.0");
        assert!(plugin.source().contains("42"));
    }

    #[test]
    fn test_load_without_manifest_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Plugin::load(dir.path()),
            Err(Error::InvalidManifest(_))
        ));
    }
}
