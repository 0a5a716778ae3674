//! Plugin Manifest
//!
//! 固定スキーマのマニフェスト。未知フィールド・必須フィールド欠落・不正なバージョンはロード時に拒否する。

use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// デフォルトのエントリファイル
pub const DEFAULT_MAIN: &str = "main.rhai";

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").ok())
        .as_ref()
}

/// マニフェストで宣言された権限
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclaredPermission {
    /// 権限タイプ（例: `fs.read`）
    pub permission: String,
    /// 対象リソース（パスパターン・ドメインなど）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// プラグインマニフェスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginManifest {
    /// プラグイン名
    pub name: String,
    /// セマンティックバージョン
    pub version: Version,
    /// 説明
    pub description: String,
    /// 表示名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// 作成者
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// プラグイン種別
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub plugin_type: Option<String>,
    /// 使用する仲介API（log, storage, fs）
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 依存関係（名前 → バージョン要件）
    #[serde(default)]
    pub dependencies: BTreeMap<String, VersionReq>,
    /// エントリファイル
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// 要求する権限
    #[serde(default)]
    pub permissions: Vec<DeclaredPermission>,
    /// 呼び出し可能なエントリポイント
    #[serde(default)]
    pub entry_points: Vec<String>,
}

impl PluginManifest {
    /// JSONから読み込み
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text)
            .map_err(|e| Error::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// TOMLから読み込み
    pub fn from_toml(text: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(text).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// スキーマ外の制約を検証
    pub fn validate(&self) -> Result<()> {
        if !name_pattern().is_some_and(|re| re.is_match(&self.name)) {
            return Err(Error::InvalidManifest(format!(
                "name '{}' must match ^[a-z0-9][a-z0-9_-]{{0,63}}$",
                self.name
            )));
        }

        if self.description.trim().is_empty() {
            return Err(Error::InvalidManifest(
                "description must not be empty".to_string(),
            ));
        }

        if let Some(main) = &self.main {
            let path = std::path::Path::new(main);
            if main.is_empty()
                || path.is_absolute()
                || path
                    .components()
                    .any(|c| !matches!(c, std::path::Component::Normal(_)))
            {
                return Err(Error::InvalidManifest(format!(
                    "main '{}' must be a relative path inside the plugin directory",
                    main
                )));
            }
        }

        for entry in &self.entry_points {
            if entry.is_empty() || !entry.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::InvalidManifest(format!(
                    "entry point '{}' is not a valid identifier",
                    entry
                )));
            }
        }

        for declared in &self.permissions {
            if declared.permission.trim().is_empty() {
                return Err(Error::InvalidManifest(
                    "declared permission type must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// エントリファイル名
    pub fn main_file(&self) -> &str {
        self.main.as_deref().unwrap_or(DEFAULT_MAIN)
    }

    /// `name@version`
    pub fn plugin_id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}
