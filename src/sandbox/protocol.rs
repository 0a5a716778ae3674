//! Isolation Boundary Protocol
//!
//! 隔離コンテキストとの間でやり取りするメッセージ。データ（`serde_json::Value`）のみが境界を越える。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::resource::IoCounters;
use crate::types::ExecutionId;

/// ホスト → 隔離コンテキスト
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxRequest {
    /// エントリポイントの呼び出し
    Invoke {
        entry_point: String,
        args: Vec<Value>,
    },
    /// コンテキストの終了
    Shutdown,
}

/// 隔離コンテキスト → ホスト
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxResponse {
    /// 正常終了
    Completed { value: Value, stats: ExecutionStats },
    /// コンテキスト内のフォールト
    Faulted {
        error: ExecutionError,
        stats: ExecutionStats,
    },
}

/// 実行統計
///
/// 実測値のみを報告する。関数呼び出し数とループ反復数は計測していないため常に `None`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// インタプリタの操作回数
    pub operations: u64,
    /// 仲介API呼び出し回数
    pub capability_calls: u64,
    /// 実行時間（ミリ秒）
    pub duration_ms: u64,
    /// 追跡メモリのピーク（ストレージ上の値＋バッファ中のI/O）
    pub peak_memory_bytes: u64,
    /// I/Oカウンタ
    pub io: IoCounters,
    /// 関数呼び出し数（計測なし）
    pub function_calls: Option<u64>,
    /// ループ反復数（計測なし）
    pub loop_iterations: Option<u64>,
}

/// 実行エラーの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionErrorKind {
    /// 実行時間超過
    Timeout,
    /// メモリ上限超過
    MemoryLimit,
    /// 操作回数上限超過
    OperationLimit,
    /// 呼び出し深度超過（無限再帰）
    StackOverflow,
    /// リソース監視による強制終了
    ResourceLimit,
    /// 外部からの強制終了
    Terminated,
    /// 隔離中のプラグイン
    Quarantined,
    /// 実行前の評価で拒否
    Blocked,
    /// 未宣言・未定義のエントリポイント
    UnknownEntryPoint,
    /// コンパイルエラー
    Compile,
    /// 実行時エラー
    Runtime,
    /// コンテキスト内のパニック
    Panic,
    /// ホスト側の障害
    Internal,
}

impl ExecutionErrorKind {
    /// 文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::MemoryLimit => "memory-limit",
            ExecutionErrorKind::OperationLimit => "operation-limit",
            ExecutionErrorKind::StackOverflow => "stack-overflow",
            ExecutionErrorKind::ResourceLimit => "resource-limit",
            ExecutionErrorKind::Terminated => "terminated",
            ExecutionErrorKind::Quarantined => "quarantined",
            ExecutionErrorKind::Blocked => "blocked",
            ExecutionErrorKind::UnknownEntryPoint => "unknown-entry-point",
            ExecutionErrorKind::Compile => "compile",
            ExecutionErrorKind::Runtime => "runtime",
            ExecutionErrorKind::Panic => "panic",
            ExecutionErrorKind::Internal => "internal",
        }
    }

    /// 無限ループ・暴走の兆候かどうか
    pub fn is_runaway(&self) -> bool {
        matches!(
            self,
            ExecutionErrorKind::Timeout
                | ExecutionErrorKind::OperationLimit
                | ExecutionErrorKind::StackOverflow
        )
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 実行エラー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// 種別
    pub kind: ExecutionErrorKind,
    /// メッセージ
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// 実行結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 実行ID
    pub execution_id: ExecutionId,
    /// プラグインID
    pub plugin_id: String,
    /// エントリポイント
    pub entry_point: String,
    /// 成功したか
    pub success: bool,
    /// 戻り値
    pub value: Option<Value>,
    /// エラー
    pub error: Option<ExecutionError>,
    /// 統計
    pub stats: ExecutionStats,
    /// 開始時刻
    pub started_at: DateTime<Utc>,
    /// 終了時刻
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// 実行せずに拒否した結果
    pub fn refused(
        execution_id: ExecutionId,
        plugin_id: impl Into<String>,
        entry_point: impl Into<String>,
        error: ExecutionError,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            plugin_id: plugin_id.into(),
            entry_point: entry_point.into(),
            success: false,
            value: None,
            error: Some(error),
            stats: ExecutionStats::default(),
            started_at: now,
            finished_at: now,
        }
    }

    /// エラー種別
    pub fn error_kind(&self) -> Option<ExecutionErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// タイムアウトで終了したか
    pub fn is_timeout(&self) -> bool {
        self.error_kind() == Some(ExecutionErrorKind::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format_carries_only_data() {
        let request = SandboxRequest::Invoke {
            entry_point: "run".to_string(),
            args: vec![serde_json::json!({"city": "Tokyo"})],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "invoke");
        assert_eq!(json["entry_point"], "run");
    }

    #[test]
    fn test_stats_leave_uninstrumented_counters_empty() {
        let stats = ExecutionStats::default();
        assert!(stats.function_calls.is_none());
        assert!(stats.loop_iterations.is_none());
    }

    #[test]
    fn test_runaway_kinds() {
        assert!(ExecutionErrorKind::Timeout.is_runaway());
        assert!(ExecutionErrorKind::StackOverflow.is_runaway());
        assert!(!ExecutionErrorKind::Runtime.is_runaway());
    }
}
