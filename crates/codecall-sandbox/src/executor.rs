//! Script executor: one fresh V8 isolate per session.
//!
//! V8 isolates are `!Send`, so all JsRuntime operations run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.
//!
//! The isolate only ever sees the sandbox permission profile and the
//! session's [`DispatchClient`]. It is dropped when the script settles,
//! times out, runs out of heap, or the session is cancelled.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use codecall_error::{ErrorKind, ErrorPayload};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::capabilities::PermissionProfile;
use crate::channel::{CallLimits, DispatchClient};
use crate::error::SandboxError;
use crate::ops::{
    codecall_caps_ext, codecall_sandbox_ext, ScriptOutput, SettleSignal, CAPABILITIES_JS,
    HARDEN_JS, SANDBOX_PRELUDE_JS,
};
use crate::script::PreparedScript;

/// Configuration for script execution.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum execution time before the script is terminated.
    pub timeout: Duration,
    /// Maximum size of submitted code in bytes.
    pub max_code_size: usize,
    /// Maximum size of the JSON result in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum calls per session.
    pub max_calls: usize,
    /// Maximum size of one call's serialized arguments in bytes.
    pub max_args_size: usize,
    /// Maximum size of one call's serialized result in bytes.
    pub max_result_size: usize,
    /// Maximum nesting depth of call arguments and results.
    pub max_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = CallLimits::default();
        Self {
            timeout: Duration::from_secs(5),
            max_code_size: 64 * 1024,        // 64 KB
            max_output_size: 1024 * 1024,    // 1 MB
            max_heap_size: 64 * 1024 * 1024, // 64 MB
            max_calls: limits.max_calls,
            max_args_size: limits.max_args_size,
            max_result_size: limits.max_result_size,
            max_depth: limits.max_depth,
        }
    }
}

impl SandboxConfig {
    /// The per-session limits enforced by the dispatch channel.
    pub fn call_limits(&self) -> CallLimits {
        CallLimits {
            max_calls: self.max_calls,
            max_args_size: self.max_args_size,
            max_result_size: self.max_result_size,
            max_depth: self.max_depth,
        }
    }
}

/// Run a prepared script on a dedicated thread.
pub async fn execute(
    config: &SandboxConfig,
    script: PreparedScript,
    client: DispatchClient,
    cancel: CancellationToken,
) -> Result<Value, SandboxError> {
    let config = config.clone();
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name(format!("codecall-script-{}", client.session_id()))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("script result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_script(&config, &script, client, cancel));
            if tx.send(result).is_err() {
                tracing::warn!("script result receiver dropped before result was sent");
            }
        })
        .map_err(|e| SandboxError::Execution(e.into()))?;

    rx.await
        .map_err(|_| SandboxError::Execution(anyhow::anyhow!("script thread panicked")))?
}

/// State for the near-heap-limit callback.
pub(crate) struct HeapLimitState {
    pub(crate) handle: v8::IsolateHandle,
    /// Whether the heap limit has been triggered. Uses AtomicBool so the callback
    /// can use a shared `&` reference instead of `&mut`.
    pub(crate) triggered: AtomicBool,
}

impl HeapLimitState {
    /// Install the callback on `runtime`. The returned box must outlive the
    /// runtime's use of the isolate.
    pub(crate) fn install(runtime: &mut JsRuntime) -> Box<Self> {
        let state = Box::new(Self {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*state as *const HeapLimitState as *mut std::ffi::c_void,
        );
        state
    }

    pub(crate) fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to a boxed `HeapLimitState` that callers drop only
    // after the runtime owning the isolate has been dropped. `triggered` is
    // atomic, so a shared reference is enough even if V8 re-enters.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

const STOP_NONE: u8 = 0;
const STOP_TIMEOUT: u8 = 1;
const STOP_CANCELLED: u8 = 2;

/// Create the script runtime: capability ops under the sandbox profile,
/// the script API, and hardening.
fn create_runtime(
    config: &SandboxConfig,
    client: DispatchClient,
    settled: Arc<Notify>,
) -> Result<JsRuntime, SandboxError> {
    let create_params = v8::CreateParams::default().heap_limits(0, config.max_heap_size);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![codecall_caps_ext::init(), codecall_sandbox_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });
    {
        let op_state = runtime.op_state();
        let mut op_state = op_state.borrow_mut();
        op_state.put(client);
        op_state.put(PermissionProfile::sandbox());
        op_state.put(SettleSignal(settled));
    }

    for (name, source) in [
        ("[codecall:capabilities]", CAPABILITIES_JS),
        ("[codecall:prelude]", SANDBOX_PRELUDE_JS),
        ("[codecall:harden]", HARDEN_JS),
    ] {
        runtime
            .execute_script(name, source)
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;
    }
    Ok(runtime)
}

/// Run a prepared script on the current thread.
///
/// Must be called from a dedicated thread, not the main tokio runtime.
async fn run_script(
    config: &SandboxConfig,
    script: &PreparedScript,
    client: DispatchClient,
    cancel: CancellationToken,
) -> Result<Value, SandboxError> {
    let session_id = client.session_id();
    let settled = Arc::new(Notify::new());
    let mut runtime = create_runtime(config, client, settled.clone())?;
    let heap_state = HeapLimitState::install(&mut runtime);

    // --- CPU watchdog: covers loops that never yield to the event loop ---
    let stop_reason = Arc::new(AtomicU8::new(STOP_NONE));
    let watchdog_done = CancellationToken::new();
    let watchdog = {
        let handle = runtime.v8_isolate().thread_safe_handle();
        let stop_reason = stop_reason.clone();
        let done = watchdog_done.clone();
        let cancel = cancel.clone();
        let deadline = Instant::now() + config.timeout;
        std::thread::spawn(move || {
            while !done.is_cancelled() {
                let reason = if cancel.is_cancelled() {
                    STOP_CANCELLED
                } else if Instant::now() >= deadline {
                    STOP_TIMEOUT
                } else {
                    std::thread::sleep(Duration::from_millis(25));
                    continue;
                };
                if stop_reason
                    .compare_exchange(STOP_NONE, reason, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    handle.terminate_execution();
                }
                break;
            }
        })
    };

    let exec_error = match runtime.execute_script("[codecall:script]", script.source.clone()) {
        Ok(_) => {
            tokio::select! {
                outcome = runtime.run_event_loop(PollEventLoopOptions::default()) => {
                    outcome.err().map(|e| e.to_string())
                }
                _ = settled.notified() => None,
                _ = tokio::time::sleep(config.timeout) => {
                    let _ = stop_reason.compare_exchange(
                        STOP_NONE, STOP_TIMEOUT, Ordering::SeqCst, Ordering::SeqCst,
                    );
                    None
                }
                _ = cancel.cancelled() => {
                    let _ = stop_reason.compare_exchange(
                        STOP_NONE, STOP_CANCELLED, Ordering::SeqCst, Ordering::SeqCst,
                    );
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };
    if cancel.is_cancelled() {
        let _ = stop_reason.compare_exchange(
            STOP_NONE,
            STOP_CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    // The watchdog must be gone before the runtime drops.
    watchdog_done.cancel();
    let _ = watchdog.join();

    let output = {
        let state = runtime.op_state();
        let state = state.borrow();
        state.try_borrow::<ScriptOutput>().map(|r| r.0.clone())
    };
    let heap_triggered = heap_state.triggered();
    drop(runtime);
    drop(heap_state);

    // --- Check causes in priority order ---
    if heap_triggered {
        tracing::warn!(session_id = %session_id, "script hit the heap limit");
        return Err(SandboxError::HeapLimitExceeded);
    }
    match stop_reason.load(Ordering::SeqCst) {
        STOP_TIMEOUT => {
            return Err(SandboxError::Timeout {
                timeout_ms: config.timeout.as_millis() as u64,
            })
        }
        STOP_CANCELLED => return Err(SandboxError::Cancelled),
        _ => {}
    }

    let Some(output) = output else {
        return Err(SandboxError::Script {
            message: exec_error
                .unwrap_or_else(|| "script finished without producing a result".into()),
            stack: None,
        });
    };
    if let Some(e) = exec_error {
        tracing::debug!(session_id = %session_id, error = %e, "event loop error after settle");
    }

    if output.len() > config.max_output_size {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_size,
        });
    }

    let mut envelope: Value = serde_json::from_str(&output)?;
    if let Some(error) = envelope.get("error") {
        return Err(match serde_json::from_value::<ErrorPayload>(error.clone()) {
            Ok(payload) if payload.kind == ErrorKind::ScriptError => SandboxError::Script {
                message: payload.message,
                stack: payload.stack,
            },
            Ok(payload) => SandboxError::Call(payload),
            Err(_) => SandboxError::Script {
                message: error.to_string(),
                stack: None,
            },
        });
    }
    Ok(envelope
        .get_mut("ok")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_channel_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.call_limits(), CallLimits::default());
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_code_size, 64 * 1024);
    }

    #[test]
    fn call_limits_follow_config() {
        let config = SandboxConfig {
            max_calls: 3,
            max_depth: 8,
            ..Default::default()
        };
        let limits = config.call_limits();
        assert_eq!(limits.max_calls, 3);
        assert_eq!(limits.max_depth, 8);
    }
}
