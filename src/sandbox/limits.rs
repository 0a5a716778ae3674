use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::types::SandboxLevel;

/// 1回の実行に適用する上限
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// 実行時間の上限（ミリ秒）
    pub max_execution_time_ms: u64,
    /// 追跡メモリの上限（バイト）
    pub max_memory_bytes: u64,
    /// 操作回数の上限（0 = 無制限）
    pub max_operations: u64,
    /// 呼び出し深度の上限
    pub max_call_depth: usize,
    /// 式のネスト上限
    pub max_expr_depth: usize,
    /// 文字列長の上限
    pub max_string_size: usize,
    /// 配列要素数の上限
    pub max_array_size: usize,
    /// マップ要素数の上限
    pub max_map_size: usize,
    /// ファイル1件あたりの上限（バイト）
    pub max_file_bytes: u64,
    /// ストレージのキー数上限
    pub max_storage_entries: usize,
}

impl ExecutionLimits {
    /// 設定とサンドボックスレベルから上限を決定
    ///
    /// strict は設定値の半分、standard と relaxed は設定値そのもの。
    pub fn from_config(config: &SandboxConfig, level: SandboxLevel) -> Self {
        let limits = Self {
            max_execution_time_ms: config.max_execution_time_ms,
            max_memory_bytes: config.max_memory_bytes,
            max_operations: config.max_operations,
            max_call_depth: config.max_call_depth,
            max_expr_depth: config.max_expr_depth,
            max_string_size: config.max_string_size,
            max_array_size: config.max_array_size,
            max_map_size: config.max_map_size,
            max_file_bytes: config.max_file_bytes,
            max_storage_entries: config.max_storage_entries,
        };

        match level {
            SandboxLevel::Strict => Self {
                max_memory_bytes: (limits.max_memory_bytes / 2).max(1),
                max_operations: limits.max_operations / 2,
                max_call_depth: (limits.max_call_depth / 2).max(8),
                max_file_bytes: (limits.max_file_bytes / 2).max(1),
                max_storage_entries: (limits.max_storage_entries / 2).max(1),
                ..limits
            },
            SandboxLevel::Standard | SandboxLevel::Relaxed => limits,
        }
    }

    /// 実行時間の上限を変更
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.max_execution_time_ms = timeout_ms.max(1);
        self
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default(), SandboxLevel::Standard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_level_halves_budgets() {
        let config = SandboxConfig::default();
        let standard = ExecutionLimits::from_config(&config, SandboxLevel::Standard);
        let strict = ExecutionLimits::from_config(&config, SandboxLevel::Strict);

        assert_eq!(strict.max_memory_bytes * 2, standard.max_memory_bytes);
        assert!(strict.max_operations < standard.max_operations);
        assert_eq!(strict.max_execution_time_ms, standard.max_execution_time_ms);
    }
}
