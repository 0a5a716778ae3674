//! Execution Handle
//!
//! 実行中コンテキストの制御フラグとカウンタ。ホスト側と隔離スレッドの両方から参照される。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::protocol::{ExecutionErrorKind, ExecutionStats};
use crate::resource::{ExecutionUsageSnapshot, IoCounters};
use crate::types::ExecutionId;

/// 強制終了の理由
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// 実行時間超過
    Timeout,
    /// メモリ上限超過
    MemoryLimit,
    /// リソース監視による終了
    ResourceLimit,
    /// 緊急対応による終了
    Emergency,
    /// プラグインの隔離
    Quarantine,
    /// ホストのシャットダウン
    Shutdown,
    /// 呼び出し元による取り消し
    Cancelled,
}

impl TerminationReason {
    /// 対応するエラー種別
    pub fn error_kind(&self) -> ExecutionErrorKind {
        match self {
            TerminationReason::Timeout => ExecutionErrorKind::Timeout,
            TerminationReason::MemoryLimit => ExecutionErrorKind::MemoryLimit,
            TerminationReason::ResourceLimit => ExecutionErrorKind::ResourceLimit,
            TerminationReason::Quarantine => ExecutionErrorKind::Quarantined,
            TerminationReason::Emergency
            | TerminationReason::Shutdown
            | TerminationReason::Cancelled => ExecutionErrorKind::Terminated,
        }
    }

    /// 文字列表現
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Timeout => "timeout",
            TerminationReason::MemoryLimit => "memory-limit",
            TerminationReason::ResourceLimit => "resource-limit",
            TerminationReason::Emergency => "emergency",
            TerminationReason::Quarantine => "quarantine",
            TerminationReason::Shutdown => "shutdown",
            TerminationReason::Cancelled => "cancelled",
        }
    }
}

/// 実行中の実行の概要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    pub entry_point: String,
    pub started_at: DateTime<Utc>,
    pub suspended: bool,
    pub restricted: bool,
    pub isolated: bool,
}

/// 実行の制御インターフェース
///
/// 緊急対応とリソース監視はこのトレイト経由で実行を操作する。
#[async_trait]
pub trait ExecutionController: Send + Sync {
    /// 強制終了（最初の呼び出しのみ `true`）
    async fn terminate(&self, execution_id: ExecutionId, reason: TerminationReason) -> bool;

    /// プラグインの全実行を強制終了
    async fn terminate_plugin(&self, plugin_id: &str, reason: TerminationReason)
        -> Vec<ExecutionId>;

    /// 一時停止
    async fn suspend(&self, execution_id: ExecutionId) -> bool;

    /// 再開
    async fn resume(&self, execution_id: ExecutionId) -> bool;

    /// 書き込み系の仲介APIを拒否する
    async fn restrict(&self, execution_id: ExecutionId) -> bool;

    /// すべての仲介APIを拒否する
    async fn isolate(&self, execution_id: ExecutionId) -> bool;

    /// 一定時間だけ実行速度を落とす
    async fn throttle(&self, execution_id: ExecutionId, duration: Duration) -> bool;

    /// 実行中かどうか
    async fn is_active(&self, execution_id: ExecutionId) -> bool;

    /// 実行中の一覧
    async fn active_executions(&self) -> Vec<ActiveExecution>;

    /// ホスト側に保持しているプラグイン状態のスナップショット
    async fn plugin_state_snapshot(&self, plugin_name: &str) -> Option<Value>;
}

/// 実行ハンドル
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub plugin_id: String,
    pub plugin_name: String,
    pub entry_point: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    deadline: Instant,

    cancelled: AtomicBool,
    finished: AtomicBool,
    reason: Mutex<Option<TerminationReason>>,
    notify: Notify,

    suspended: AtomicBool,
    restricted: AtomicBool,
    isolated: AtomicBool,
    throttled_until_ms: AtomicU64,

    operations: AtomicU64,
    capability_calls: AtomicU64,
    blocked_nanos: AtomicU64,
    paused_nanos: AtomicU64,

    heap_bytes: AtomicU64,
    peak_heap_bytes: AtomicU64,
    external_bytes: AtomicU64,
    peak_external_bytes: AtomicU64,

    io_read_bytes: AtomicU64,
    io_write_bytes: AtomicU64,
    io_read_ops: AtomicU64,
    io_write_ops: AtomicU64,
}

impl ExecutionHandle {
    pub fn new(
        execution_id: ExecutionId,
        plugin_id: impl Into<String>,
        plugin_name: impl Into<String>,
        entry_point: impl Into<String>,
        max_execution_time: Duration,
    ) -> Self {
        let started = Instant::now();
        Self {
            execution_id,
            plugin_id: plugin_id.into(),
            plugin_name: plugin_name.into(),
            entry_point: entry_point.into(),
            started_at: Utc::now(),
            started,
            deadline: started + max_execution_time,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
            suspended: AtomicBool::new(false),
            restricted: AtomicBool::new(false),
            isolated: AtomicBool::new(false),
            throttled_until_ms: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            capability_calls: AtomicU64::new(0),
            blocked_nanos: AtomicU64::new(0),
            paused_nanos: AtomicU64::new(0),
            heap_bytes: AtomicU64::new(0),
            peak_heap_bytes: AtomicU64::new(0),
            external_bytes: AtomicU64::new(0),
            peak_external_bytes: AtomicU64::new(0),
            io_read_bytes: AtomicU64::new(0),
            io_write_bytes: AtomicU64::new(0),
            io_read_ops: AtomicU64::new(0),
            io_write_ops: AtomicU64::new(0),
        }
    }

    // --- 終了制御 ---

    /// 強制終了を要求（最初の要求のみ `true`）
    pub fn terminate(&self, reason: TerminationReason) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason);
        }
        // 待機者がいなくても許可を残す
        self.notify.notify_one();
        true
    }

    /// 取り消し済みか
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 終了理由
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason.lock().ok().and_then(|slot| *slot)
    }

    /// 終了要求を待つ
    pub async fn terminated(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }

    /// 結果が確定した（以後の終了要求は無効）
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// 結果確定後にスレッドを確実に止める
    pub fn release_context(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// 実行時間の上限を過ぎたか
    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    // --- 実行制御フラグ ---

    pub fn set_suspended(&self, value: bool) -> bool {
        self.suspended.swap(value, Ordering::SeqCst) != value
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn set_restricted(&self) -> bool {
        !self.restricted.swap(true, Ordering::SeqCst)
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted.load(Ordering::SeqCst)
    }

    pub fn set_isolated(&self) -> bool {
        !self.isolated.swap(true, Ordering::SeqCst)
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated.load(Ordering::SeqCst)
    }

    /// 一定時間スロットルする
    pub fn throttle_for(&self, duration: Duration) {
        let until = self.elapsed() + duration;
        self.throttled_until_ms
            .fetch_max(until.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn is_throttled(&self) -> bool {
        let until = self.throttled_until_ms.load(Ordering::SeqCst);
        until > 0 && (self.elapsed().as_millis() as u64) < until
    }

    /// 一時停止・スロットル中は隔離スレッドを待機させる
    ///
    /// 隔離スレッドからのみ呼ぶこと。
    pub fn pause_point(&self) {
        if self.is_throttled() {
            std::thread::sleep(Duration::from_millis(1));
            self.paused_nanos.fetch_add(1_000_000, Ordering::Relaxed);
        }
        while self.is_suspended() && !self.is_cancelled() {
            let started = Instant::now();
            std::thread::sleep(Duration::from_millis(5));
            self.paused_nanos
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
    }

    // --- カウンタ ---

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_operations(&self, operations: u64) {
        self.operations.store(operations, Ordering::Relaxed);
    }

    pub fn record_capability_call(&self) {
        self.capability_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_blocked(&self, duration: Duration) {
        self.blocked_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// 追跡ヒープ量を更新
    pub fn set_heap_bytes(&self, bytes: u64) {
        self.heap_bytes.store(bytes, Ordering::Relaxed);
        self.peak_heap_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// バッファ中のI/O量を更新
    pub fn set_external_bytes(&self, bytes: u64) {
        self.external_bytes.store(bytes, Ordering::Relaxed);
        self.peak_external_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64) {
        self.io_read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.io_read_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.io_write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.io_write_ops.fetch_add(1, Ordering::Relaxed);
    }

    fn io(&self) -> IoCounters {
        IoCounters {
            read_bytes: self.io_read_bytes.load(Ordering::Relaxed),
            write_bytes: self.io_write_bytes.load(Ordering::Relaxed),
            read_ops: self.io_read_ops.load(Ordering::Relaxed),
            write_ops: self.io_write_ops.load(Ordering::Relaxed),
        }
    }

    /// CPU時間の近似（経過時間からブロック・停止時間を除く）
    pub fn cpu_time(&self) -> Duration {
        let idle = self.blocked_nanos.load(Ordering::Relaxed)
            + self.paused_nanos.load(Ordering::Relaxed);
        self.elapsed()
            .saturating_sub(Duration::from_nanos(idle))
    }

    /// 実行統計
    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            operations: self.operations.load(Ordering::Relaxed),
            capability_calls: self.capability_calls.load(Ordering::Relaxed),
            duration_ms: self.elapsed().as_millis() as u64,
            peak_memory_bytes: self.peak_heap_bytes.load(Ordering::Relaxed)
                + self.peak_external_bytes.load(Ordering::Relaxed),
            io: self.io(),
            function_calls: None,
            loop_iterations: None,
        }
    }

    /// リソース監視向けのスナップショット
    pub fn usage_snapshot(&self) -> ExecutionUsageSnapshot {
        ExecutionUsageSnapshot {
            plugin_id: self.plugin_id.clone(),
            heap_bytes: self.heap_bytes.load(Ordering::Relaxed),
            external_bytes: self.external_bytes.load(Ordering::Relaxed),
            cpu_time_ms: self.cpu_time().as_millis() as u64,
            elapsed_ms: self.elapsed().as_millis() as u64,
            io: self.io(),
            operations: self.operations.load(Ordering::Relaxed),
        }
    }

    /// 概要
    pub fn summary(&self) -> ActiveExecution {
        ActiveExecution {
            execution_id: self.execution_id,
            plugin_id: self.plugin_id.clone(),
            entry_point: self.entry_point.clone(),
            started_at: self.started_at,
            suspended: self.is_suspended(),
            restricted: self.is_restricted(),
            isolated: self.is_isolated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn handle() -> ExecutionHandle {
        ExecutionHandle::new(
            Uuid::new_v4(),
            "demo@1.0.0",
            "demo",
            "run",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_terminate_only_once() {
        let handle = handle();
        assert!(handle.terminate(TerminationReason::Timeout));
        assert!(!handle.terminate(TerminationReason::Emergency));
        assert_eq!(
            handle.termination_reason(),
            Some(TerminationReason::Timeout)
        );
    }

    #[test]
    fn test_terminate_after_finish_is_rejected() {
        let handle = handle();
        handle.mark_finished();
        assert!(!handle.terminate(TerminationReason::Emergency));
        assert!(handle.termination_reason().is_none());
    }

    #[tokio::test]
    async fn test_terminated_future_resolves() {
        let handle = std::sync::Arc::new(handle());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.terminated().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.terminate(TerminationReason::Cancelled);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_peak_memory_tracking() {
        let handle = handle();
        handle.set_heap_bytes(100);
        handle.set_heap_bytes(40);
        handle.set_external_bytes(10);
        handle.set_external_bytes(0);
        assert_eq!(handle.stats().peak_memory_bytes, 110);
        assert_eq!(handle.usage_snapshot().heap_bytes, 40);
    }

    #[test]
    fn test_flags() {
        let handle = handle();
        assert!(handle.set_restricted());
        assert!(!handle.set_restricted());
        assert!(handle.set_suspended(true));
        assert!(handle.is_suspended());
        assert!(handle.set_suspended(false));
        handle.throttle_for(Duration::from_secs(10));
        assert!(handle.is_throttled());
    }
}
