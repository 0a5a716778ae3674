//! Sandbox Executor
//!
//! プラグインコードを専用スレッド上の隔離コンテキストで実行し、
//! 実行時間・メモリ・操作数の上限と仲介APIのみを与える。

pub mod capabilities;
pub mod context;
pub mod executor;
pub mod handle;
pub mod limits;
pub mod protocol;

pub use capabilities::{
    resolve_plugin_path, AuthorizationDecision, CapabilityAuthorizer, CapabilityBroker,
    CapabilityCall, CapabilityError, CapabilityReply, CapabilityRequest, DenyAllAuthorizer,
};
pub use context::{hardened_engine, DryRunReport, IsolatedContext};
pub use executor::SandboxExecutor;
pub use handle::{ActiveExecution, ExecutionController, ExecutionHandle, TerminationReason};
pub use limits::ExecutionLimits;
pub use protocol::{
    ExecutionError, ExecutionErrorKind, ExecutionResult, ExecutionStats, SandboxRequest,
    SandboxResponse,
};
