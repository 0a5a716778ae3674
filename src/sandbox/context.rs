//! Isolated Execution Context
//!
//! 1回の呼び出しごとに専用スレッドと専用の Rhai エンジンを作る。
//! ソースはスレッド内で一度だけコンパイルされ、境界を越えるのはデータのみ。

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, OptimizationLevel, Position, Scope, AST};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::capabilities::{CapabilityCall, CapabilityError, CapabilityRequest};
use super::handle::{ExecutionHandle, TerminationReason};
use super::limits::ExecutionLimits;
use super::protocol::{ExecutionError, ExecutionErrorKind, SandboxRequest, SandboxResponse};
use crate::plugin::{Plugin, PluginManifest};

/// 進捗フックで期限と一時停止を確認する間隔（操作数）
const CHECK_INTERVAL: u64 = 512;

/// 仲介API以外の機能を持たないエンジンを作成
pub fn hardened_engine(limits: &ExecutionLimits) -> Engine {
    let mut engine = Engine::new();
    engine.set_optimization_level(OptimizationLevel::None);
    engine.disable_symbol("eval");
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.set_max_modules(0);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_depth);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine
}

fn terminated_error() -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(
        Dynamic::from("terminated"),
        Position::NONE,
    ))
}

/// 隔離スレッド側の仲介APIクライアント
struct CapabilityClient {
    calls: mpsc::UnboundedSender<CapabilityCall>,
    handle: Arc<ExecutionHandle>,
}

impl CapabilityClient {
    /// ホストに呼び出しを送り、応答まで隔離スレッドをブロックする
    fn call(&self, request: CapabilityRequest) -> Result<Value, Box<EvalAltResult>> {
        if self.handle.is_cancelled() {
            return Err(terminated_error());
        }
        self.handle.record_capability_call();

        let (reply_tx, reply_rx) = oneshot::channel();
        let started = Instant::now();
        self.calls
            .send(CapabilityCall {
                request,
                reply: reply_tx,
            })
            .map_err(|_| terminated_error())?;

        let reply = reply_rx.blocking_recv();
        self.handle.add_blocked(started.elapsed());

        match reply {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(CapabilityError::Terminated)) | Err(_) => Err(terminated_error()),
            Ok(Err(error)) => Err(error.to_string().into()),
        }
    }
}

fn to_value(value: &Dynamic) -> Result<Value, Box<EvalAltResult>> {
    rhai::serde::from_dynamic::<Value>(value)
}

fn to_dynamic(value: Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

/// 仲介APIと出力フックを登録
fn register_capabilities(engine: &mut Engine, client: Arc<CapabilityClient>) {
    let c = client.clone();
    engine.register_fn("log", move |message: &str| -> Result<(), Box<EvalAltResult>> {
        c.call(CapabilityRequest::Log {
            level: "info".to_string(),
            message: message.to_string(),
        })
        .map(|_| ())
    });

    let c = client.clone();
    engine.register_fn(
        "log",
        move |level: &str, message: &str| -> Result<(), Box<EvalAltResult>> {
            c.call(CapabilityRequest::Log {
                level: level.to_string(),
                message: message.to_string(),
            })
            .map(|_| ())
        },
    );

    let c = client.clone();
    engine.register_fn("storage_get", move |key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value = c.call(CapabilityRequest::StorageGet {
            key: key.to_string(),
        })?;
        to_dynamic(value)
    });

    let c = client.clone();
    engine.register_fn(
        "storage_set",
        move |key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
            let value = to_value(&value)?;
            c.call(CapabilityRequest::StorageSet {
                key: key.to_string(),
                value,
            })
            .map(|_| ())
        },
    );

    let c = client.clone();
    engine.register_fn("storage_delete", move |key: &str| -> Result<bool, Box<EvalAltResult>> {
        let removed = c.call(CapabilityRequest::StorageDelete {
            key: key.to_string(),
        })?;
        Ok(removed.as_bool().unwrap_or(false))
    });

    let c = client.clone();
    engine.register_fn("fs_read_file", move |path: &str| -> Result<String, Box<EvalAltResult>> {
        let content = c.call(CapabilityRequest::FsReadFile {
            path: path.to_string(),
        })?;
        Ok(content.as_str().unwrap_or_default().to_string())
    });

    let c = client.clone();
    engine.register_fn(
        "fs_write_file",
        move |path: &str, content: &str| -> Result<(), Box<EvalAltResult>> {
            c.call(CapabilityRequest::FsWriteFile {
                path: path.to_string(),
                content: content.to_string(),
            })
            .map(|_| ())
        },
    );

    let c = client.clone();
    engine.register_fn("fs_exists", move |path: &str| -> Result<bool, Box<EvalAltResult>> {
        let exists = c.call(CapabilityRequest::FsExists {
            path: path.to_string(),
        })?;
        Ok(exists.as_bool().unwrap_or(false))
    });

    // print / debug も仲介された log を通す
    let c = client.clone();
    engine.on_print(move |text| {
        let _ = c.call(CapabilityRequest::Log {
            level: "info".to_string(),
            message: text.to_string(),
        });
    });

    let c = client;
    engine.on_debug(move |text, _source, _pos| {
        let _ = c.call(CapabilityRequest::Log {
            level: "debug".to_string(),
            message: text.to_string(),
        });
    });
}

/// 進捗フック（操作数の記録・終了要求・期限・一時停止）
fn install_progress_hook(engine: &mut Engine, handle: Arc<ExecutionHandle>) {
    engine.on_progress(move |operations| {
        handle.record_operations(operations);
        if handle.is_cancelled() {
            return Some(Dynamic::from("terminated"));
        }
        if operations % CHECK_INTERVAL == 0 {
            if handle.deadline_passed() {
                handle.terminate(TerminationReason::Timeout);
                return Some(Dynamic::from("timeout"));
            }
            handle.pause_point();
            if handle.is_cancelled() {
                return Some(Dynamic::from("terminated"));
            }
        }
        None
    });
}

fn root_cause(error: &EvalAltResult) -> &EvalAltResult {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        other => other,
    }
}

/// Rhai のエラーを実行エラーに変換
fn map_eval_error(error: &EvalAltResult, handle: &ExecutionHandle) -> ExecutionError {
    let reason_kind = handle
        .termination_reason()
        .map(|reason| reason.error_kind())
        .unwrap_or(ExecutionErrorKind::Terminated);

    match root_cause(error) {
        EvalAltResult::ErrorTerminated(..) => {
            ExecutionError::new(reason_kind, format!("execution terminated: {}", error))
        }
        EvalAltResult::ErrorTooManyOperations(..) => ExecutionError::new(
            ExecutionErrorKind::OperationLimit,
            "operation limit exceeded",
        ),
        EvalAltResult::ErrorStackOverflow(..) => ExecutionError::new(
            ExecutionErrorKind::StackOverflow,
            "call depth limit exceeded",
        ),
        EvalAltResult::ErrorDataTooLarge(what, ..) => ExecutionError::new(
            ExecutionErrorKind::MemoryLimit,
            format!("data size limit exceeded: {}", what),
        ),
        _ if handle.is_cancelled() => {
            ExecutionError::new(reason_kind, format!("execution terminated: {}", error))
        }
        _ => ExecutionError::new(ExecutionErrorKind::Runtime, error.to_string()),
    }
}

/// エントリポイントが宣言済みかつ AST に存在するか
pub fn resolve_entry_point(
    manifest: &PluginManifest,
    ast: &AST,
    entry_point: &str,
    arity: usize,
) -> Result<(), ExecutionError> {
    if !manifest.entry_points.iter().any(|e| e == entry_point) {
        return Err(ExecutionError::new(
            ExecutionErrorKind::UnknownEntryPoint,
            format!("entry point '{}' is not declared in the manifest", entry_point),
        ));
    }
    let defined = ast
        .iter_functions()
        .any(|f| f.name == entry_point && f.params.len() == arity);
    if !defined {
        return Err(ExecutionError::new(
            ExecutionErrorKind::UnknownEntryPoint,
            format!(
                "entry point '{}' with {} argument(s) is not defined",
                entry_point, arity
            ),
        ));
    }
    Ok(())
}

fn invoke(
    engine: &Engine,
    ast: &AST,
    manifest: &PluginManifest,
    handle: &ExecutionHandle,
    entry_point: &str,
    args: Vec<Value>,
) -> Result<Value, ExecutionError> {
    resolve_entry_point(manifest, ast, entry_point, args.len())?;

    let args = args
        .into_iter()
        .map(to_dynamic)
        .collect::<Result<Vec<Dynamic>, _>>()
        .map_err(|e| {
            ExecutionError::new(
                ExecutionErrorKind::Runtime,
                format!("argument conversion failed: {}", e),
            )
        })?;

    let mut scope = Scope::new();
    let result = engine
        .call_fn::<Dynamic>(&mut scope, ast, entry_point, args)
        .map_err(|e| map_eval_error(&e, handle))?;

    to_value(&result).map_err(|e| {
        ExecutionError::new(
            ExecutionErrorKind::Runtime,
            format!("return value is not plain data: {}", e),
        )
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 隔離コンテキストの本体（専用スレッドで動く）
fn context_main(
    handle: Arc<ExecutionHandle>,
    plugin: Plugin,
    limits: ExecutionLimits,
    requests: std_mpsc::Receiver<SandboxRequest>,
    calls: mpsc::UnboundedSender<CapabilityCall>,
    responses: mpsc::UnboundedSender<SandboxResponse>,
) {
    let mut engine = hardened_engine(&limits);
    let client = Arc::new(CapabilityClient {
        calls,
        handle: handle.clone(),
    });
    register_capabilities(&mut engine, client);
    install_progress_hook(&mut engine, handle.clone());

    let compiled = engine.compile(plugin.source()).map_err(|e| {
        ExecutionError::new(
            ExecutionErrorKind::Compile,
            format!("{}: {}", plugin.manifest().main_file(), e),
        )
    });

    while let Ok(request) = requests.recv() {
        match request {
            SandboxRequest::Invoke { entry_point, args } => {
                let outcome = match &compiled {
                    Ok(ast) => catch_unwind(AssertUnwindSafe(|| {
                        invoke(&engine, ast, plugin.manifest(), &handle, &entry_point, args)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(ExecutionError::new(
                            ExecutionErrorKind::Panic,
                            panic_message(payload),
                        ))
                    }),
                    Err(error) => Err(error.clone()),
                };

                let stats = handle.stats();
                let response = match outcome {
                    Ok(value) => SandboxResponse::Completed { value, stats },
                    Err(error) => SandboxResponse::Faulted { error, stats },
                };
                if responses.send(response).is_err() {
                    debug!(execution_id = %handle.execution_id, "Host stopped listening; dropping response");
                    break;
                }
            }
            SandboxRequest::Shutdown => break,
        }
    }

    debug!(execution_id = %handle.execution_id, "Isolated context exited");
}

/// 隔離コンテキストへのホスト側の参照
pub struct IsolatedContext {
    requests: Option<std_mpsc::Sender<SandboxRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl IsolatedContext {
    /// 専用スレッドでコンテキストを起動
    pub fn spawn(
        handle: Arc<ExecutionHandle>,
        plugin: Plugin,
        limits: ExecutionLimits,
        calls: mpsc::UnboundedSender<CapabilityCall>,
        responses: mpsc::UnboundedSender<SandboxResponse>,
    ) -> std::io::Result<Self> {
        let (request_tx, request_rx) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("sandbox-{}", handle.execution_id))
            .spawn(move || context_main(handle, plugin, limits, request_rx, calls, responses))?;

        Ok(Self {
            requests: Some(request_tx),
            thread: Some(thread),
        })
    }

    /// リクエストを送信
    pub fn send(&self, request: SandboxRequest) -> bool {
        self.requests
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok())
    }

    /// コンテキストを閉じる（スレッドの終了は待たない）
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.requests.take() {
            let _ = tx.send(SandboxRequest::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                if thread.join().is_err() {
                    warn!("Isolated context thread panicked during shutdown");
                }
            }
            // 実行中のスレッドは進捗フックの取り消しで自ら終了する
        }
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 実行せずにコンパイルだけ行った結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    /// コンパイルに成功したか
    pub compiled: bool,
    /// コンパイルエラー
    pub error: Option<String>,
    /// 定義された関数（名前, 引数の数）
    pub functions: Vec<(String, usize)>,
    /// 宣言されているが定義のないエントリポイント
    pub missing_entry_points: Vec<String>,
}

impl DryRunReport {
    pub fn passed(&self) -> bool {
        self.compiled && self.missing_entry_points.is_empty()
    }
}

/// 強化済みエンジンでコンパイルのみ行う
pub fn dry_run(plugin: &Plugin, limits: &ExecutionLimits) -> DryRunReport {
    let engine = hardened_engine(limits);
    match engine.compile(plugin.source()) {
        Ok(ast) => {
            let functions: Vec<(String, usize)> = ast
                .iter_functions()
                .map(|f| (f.name.to_string(), f.params.len()))
                .collect();
            let missing_entry_points = plugin
                .manifest()
                .entry_points
                .iter()
                .filter(|entry| !functions.iter().any(|(name, _)| name == *entry))
                .cloned()
                .collect();
            DryRunReport {
                compiled: true,
                error: None,
                functions,
                missing_entry_points,
            }
        }
        Err(error) => DryRunReport {
            compiled: false,
            error: Some(error.to_string()),
            functions: Vec::new(),
            missing_entry_points: plugin.manifest().entry_points.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(source: &str, entry_points: &[&str]) -> Plugin {
        let manifest = PluginManifest::from_json(
            &serde_json::json!({
                "name": "demo",
                "version": "1.0.0",
                "description": "demo plugin",
                "entryPoints": entry_points,
            })
            .to_string(),
        )
        .unwrap();
        Plugin::new(manifest, source).unwrap()
    }

    #[test]
    fn test_eval_is_disabled() {
        let engine = hardened_engine(&ExecutionLimits::default());
        assert!(engine.compile(r#"eval("1 + 1")"#).is_err());
    }

    #[test]
    fn test_imports_do_not_resolve() {
        let engine = hardened_engine(&ExecutionLimits::default());
        assert!(engine.run(r#"import "std" as s;"#).is_err());
    }

    #[test]
    fn test_dry_run_reports_missing_entry_points() {
        let plugin = plugin("fn run(x) { x + 1 }", &["run", "cleanup"]);
        let report = dry_run(&plugin, &ExecutionLimits::default());
        assert!(report.compiled);
        assert_eq!(report.functions, vec![("run".to_string(), 1)]);
        assert_eq!(report.missing_entry_points, vec!["cleanup".to_string()]);
        assert!(!report.passed());
    }

    #[test]
    fn test_dry_run_compile_failure() {
        let plugin = plugin("fn run( { ", &["run"]);
        let report = dry_run(&plugin, &ExecutionLimits::default());
        assert!(!report.compiled);
        assert!(report.error.is_some());
    }

    #[test]
    fn test_entry_point_must_be_declared_and_defined() {
        let plugin = plugin("fn run() { 1 } fn hidden() { 2 }", &["run"]);
        let engine = hardened_engine(&ExecutionLimits::default());
        let ast = engine.compile(plugin.source()).unwrap();

        assert!(resolve_entry_point(plugin.manifest(), &ast, "run", 0).is_ok());
        // 未宣言の関数は呼べない
        let err = resolve_entry_point(plugin.manifest(), &ast, "hidden", 0).unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::UnknownEntryPoint);
        // 引数の数も一致が必要
        assert!(resolve_entry_point(plugin.manifest(), &ast, "run", 2).is_err());
    }
}
