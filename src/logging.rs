//! Logging
//!
//! tracing-subscriber によるログ初期化と、ローテーション済みログファイルの保持ポリシー

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogRetentionConfig, LoggingConfig};

/// ログファイル名の接頭辞（rolling appender が日付を付与する）
const LOG_FILE_PREFIX: &str = "plugin-sentinel.log";

/// ログ初期化設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub log_dir: PathBuf,
    pub rotation: LogRotation,
    pub retention: LogRetention,
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub json_format: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

/// ローテーション済みファイルの保持ポリシー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRetention {
    /// 削除しない（外部のログ管理に任せる）
    External,
    /// 更新から指定日数を過ぎたファイルを削除
    Days(u32),
    /// 新しい順に指定数だけ残す
    Count(u32),
    /// 新しい順に合計バイト数の枠内だけ残す
    Size(u64),
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from(&LoggingConfig::default())
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        let rotation = match config.rotation.as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        };
        Self {
            level: config.level.clone(),
            log_dir: config
                .log_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("plugin-sentinel").join("logs")),
            rotation,
            retention: LogRetention::from(&config.retention),
            console_enabled: config.console,
            file_enabled: config.file,
            json_format: config.json,
        }
    }
}

impl From<&LogRetentionConfig> for LogRetention {
    fn from(config: &LogRetentionConfig) -> Self {
        match config.policy.as_deref() {
            Some("days") => LogRetention::Days(config.days.unwrap_or(30)),
            Some("count") => LogRetention::Count(config.count.unwrap_or(10)),
            Some("size") => LogRetention::Size(u64::from(config.size_mb.unwrap_or(100)) << 20),
            _ => LogRetention::External,
        }
    }
}

/// ログファイル1件の情報
#[derive(Debug, Clone)]
struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

impl LogRetention {
    /// 削除対象のファイルを選ぶ。`files` は新しい順に並んでいること。
    fn expired<'a>(&self, files: &'a [LogFile], now: SystemTime) -> Vec<&'a LogFile> {
        match *self {
            LogRetention::External => Vec::new(),
            LogRetention::Days(days) => {
                let cutoff = now
                    .checked_sub(Duration::from_secs(u64::from(days) * 86_400))
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.iter().filter(|f| f.modified < cutoff).collect()
            }
            LogRetention::Count(keep) => files.iter().skip(keep as usize).collect(),
            LogRetention::Size(budget) => {
                let mut used = 0u64;
                files
                    .iter()
                    .filter(|f| {
                        if used + f.size <= budget {
                            used += f.size;
                            false
                        } else {
                            true
                        }
                    })
                    .collect()
            }
        }
    }
}

/// ログ出力のガード
///
/// ドロップするとファイルライターがフラッシュされて停止する。プロセス終了まで保持すること。
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// グローバルサブスクライバーを設定する
///
/// 二回目以降の呼び出しはエラーになる。
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console = config.console_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    });

    let (file, file_guard) = if config.file_enabled {
        fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;
        let appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_PREFIX),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_PREFIX),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_PREFIX),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_line_number(true);
        let layer = if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        level = %config.level,
        console = config.console_enabled,
        file = config.file_enabled,
        "Logging initialized"
    );

    if config.file_enabled {
        match prune_logs(&config.log_dir, config.retention) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Pruned rotated log files"),
            Err(e) => tracing::warn!("Failed to apply log retention: {:#}", e),
        }
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// 保持ポリシーに従ってローテーション済みログを削除し、削除件数を返す
pub fn prune_logs(log_dir: &Path, retention: LogRetention) -> Result<usize> {
    if retention == LogRetention::External || !log_dir.exists() {
        return Ok(0);
    }
    let files = list_log_files(log_dir)?;

    let mut removed = 0;
    for file in retention.expired(&files, SystemTime::now()) {
        match fs::remove_file(&file.path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Failed to remove log file {}: {}", file.path.display(), e),
        }
    }
    Ok(removed)
}

/// 新しい順のログファイル一覧
fn list_log_files(log_dir: &Path) -> Result<Vec<LogFile>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let is_ours = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_ours {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push(LogFile {
                path: entry.path(),
                modified: metadata.modified()?,
                size: metadata.len(),
            });
        }
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, age_days: u64, size: u64, now: SystemTime) -> LogFile {
        LogFile {
            path: PathBuf::from(name),
            modified: now - Duration::from_secs(age_days * 86_400),
            size,
        }
    }

    #[test]
    fn test_log_config_from_logging_config() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            rotation: "hourly".to_string(),
            retention: LogRetentionConfig {
                policy: Some("count".to_string()),
                count: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = LogConfig::from(&logging);
        assert_eq!(config.level, "debug");
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert_eq!(config.retention, LogRetention::Count(3));
    }

    #[test]
    fn test_retention_selection() {
        let now = SystemTime::now();
        // 新しい順
        let files = vec![
            file("a", 0, 600, now),
            file("b", 5, 600, now),
            file("c", 40, 600, now),
        ];

        let names = |selected: Vec<&LogFile>| -> Vec<String> {
            selected
                .iter()
                .map(|f| f.path.display().to_string())
                .collect()
        };

        assert!(LogRetention::External.expired(&files, now).is_empty());
        assert_eq!(names(LogRetention::Days(30).expired(&files, now)), ["c"]);
        assert_eq!(names(LogRetention::Count(1).expired(&files, now)), ["b", "c"]);
        assert_eq!(names(LogRetention::Size(1000).expired(&files, now)), ["b", "c"]);
    }

    #[test]
    fn test_prune_logs_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=3 {
            fs::write(
                dir.path().join(format!("{}.2026-01-0{}", LOG_FILE_PREFIX, day)),
                "line\n",
            )
            .unwrap();
            // 更新時刻に差をつける
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("other.txt"), "keep").unwrap();

        let removed = prune_logs(dir.path(), LogRetention::Count(1)).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("other.txt").exists());
        assert_eq!(list_log_files(dir.path()).unwrap().len(), 1);
    }
}
