//! Privileged function hosts.
//!
//! A host receives [`CallForward`]s for one session, runs the named
//! function, and answers with a [`CallResult`] carrying the same ids. Two
//! hosts exist:
//!
//! - [`ScriptFunctionHost`] loads the registry's source modules into a V8
//!   isolate of its own, under the function permission profile.
//! - [`NativeFunctionHost`] runs Rust async closures registered with
//!   explicit descriptors, for embedding and tests.
//!
//! Both validate the call against the registry snapshot before running
//! anything, so `UnknownFunction` and `InvalidArguments` never reach
//! function code.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use codecall_error::CallError;
use codecall_registry::{FunctionDescriptor, RegistrationError, Registry};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::capabilities::PermissionProfile;
use crate::channel::{CallForward, CallResult, SessionId};
use crate::error::SandboxError;
use crate::executor::HeapLimitState;
use crate::ops::{
    codecall_caps_ext, codecall_host_ext, HostState, CAPABILITIES_JS, HOST_PRELUDE_JS,
};
use crate::redact::function_fault;
use crate::FunctionHost;

/// The privileged side of one open session.
pub struct HostSession {
    forward: mpsc::UnboundedSender<CallForward>,
    cancel: CancellationToken,
    isolate: Option<v8::IsolateHandle>,
}

impl HostSession {
    /// Where the session's calls are sent.
    pub fn forward(&self) -> mpsc::UnboundedSender<CallForward> {
        self.forward.clone()
    }

    /// Stop the session's host, interrupting any function still running.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(isolate) = &self.isolate {
            isolate.terminate_execution();
        }
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Check a forwarded call against the registry.
pub fn resolve_call(registry: &Registry, forward: &CallForward) -> Result<(), CallError> {
    registry
        .lookup(&forward.function_name)?
        .validate_args(&forward.args)
}

fn rejected(forward: &CallForward, err: CallError) -> CallResult {
    tracing::debug!(
        session_id = %forward.session_id,
        call_id = forward.call_id,
        function = %forward.function_name,
        error = %err,
        "call rejected"
    );
    CallResult::error(forward.session_id, forward.call_id, err.to_payload())
}

/// Runs registered source modules in a dedicated V8 isolate per session.
#[derive(Debug, Clone)]
pub struct ScriptFunctionHost {
    profile: PermissionProfile,
    max_heap_size: usize,
}

impl Default for ScriptFunctionHost {
    fn default() -> Self {
        Self::new(PermissionProfile::function_full())
    }
}

impl ScriptFunctionHost {
    /// A host whose functions run under `profile`.
    pub fn new(profile: PermissionProfile) -> Self {
        Self {
            profile,
            max_heap_size: 256 * 1024 * 1024, // 256 MB
        }
    }

    /// Set the function isolate's heap limit.
    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = bytes;
        self
    }
}

#[async_trait::async_trait]
impl FunctionHost for ScriptFunctionHost {
    async fn open(
        &self,
        session_id: SessionId,
        registry: Arc<Registry>,
        results: mpsc::UnboundedSender<CallResult>,
        cancel: CancellationToken,
    ) -> Result<HostSession, SandboxError> {
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let profile = self.profile.clone();
        let max_heap_size = self.max_heap_size;
        let session_cancel = cancel.clone();

        std::thread::Builder::new()
            .name(format!("codecall-host-{session_id}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SandboxError::Execution(e.into())));
                        return;
                    }
                };
                let ctx = SessionContext {
                    session_id,
                    profile,
                    max_heap_size,
                    registry,
                    forward_rx,
                    results,
                    cancel: session_cancel,
                };
                rt.block_on(serve_session(ctx, ready_tx));
            })
            .map_err(|e| SandboxError::Execution(e.into()))?;

        let isolate = ready_rx.await.map_err(|_| {
            SandboxError::Execution(anyhow::anyhow!("function host thread exited during startup"))
        })??;
        Ok(HostSession {
            forward: forward_tx,
            cancel,
            isolate: Some(isolate),
        })
    }
}

struct SessionContext {
    session_id: SessionId,
    profile: PermissionProfile,
    max_heap_size: usize,
    registry: Arc<Registry>,
    forward_rx: mpsc::UnboundedReceiver<CallForward>,
    results: mpsc::UnboundedSender<CallResult>,
    cancel: CancellationToken,
}

/// Create the function runtime and evaluate every source module into it.
fn load_runtime(ctx: &SessionContext) -> Result<JsRuntime, SandboxError> {
    let create_params = v8::CreateParams::default().heap_limits(0, ctx.max_heap_size);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![codecall_caps_ext::init(), codecall_host_ext::init()],
        create_params: Some(create_params),
        ..Default::default()
    });
    {
        let op_state = runtime.op_state();
        let mut op_state = op_state.borrow_mut();
        op_state.put(ctx.profile.clone());
        op_state.put(HostState {
            session_id: ctx.session_id,
            results: ctx.results.clone(),
            in_flight: HashMap::new(),
        });
    }

    for (name, source) in [
        ("[codecall:capabilities]", CAPABILITIES_JS),
        ("[codecall:host]", HOST_PRELUDE_JS),
    ] {
        runtime
            .execute_script(name, source)
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;
    }

    for module in ctx.registry.modules() {
        let path = serde_json::to_string(&module.path)?;
        let names: Vec<&str> = ctx
            .registry
            .descriptors()
            .filter(|d| d.source_file == module.path)
            .map(|d| d.name.as_str())
            .collect();
        let names = serde_json::to_string(&names)?;
        let source = format!(
            "({})(__codecall_register_module({path}, {names}));\n//# sourceURL={}",
            module.runtime_js, module.path
        );
        runtime
            .execute_script("[codecall:module]", source)
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!(
                    "failed to load {}: {}",
                    module.path,
                    e
                ))
            })?;
    }
    Ok(runtime)
}

fn in_flight_count(runtime: &JsRuntime) -> usize {
    runtime.op_state().borrow().borrow::<HostState>().in_flight.len()
}

/// Answer every call still in flight with a fault.
fn fail_in_flight(runtime: &JsRuntime, message: &str) {
    let op_state = runtime.op_state();
    let mut op_state = op_state.borrow_mut();
    let host = op_state.borrow_mut::<HostState>();
    for (call_id, function) in host.in_flight.drain() {
        let _ = host.results.send(CallResult::error(
            host.session_id,
            call_id,
            function_fault(&function, message, None),
        ));
    }
}

/// Hand one call to JavaScript.
fn invoke(
    runtime: &mut JsRuntime,
    registry: &Registry,
    forward: CallForward,
    results: &mpsc::UnboundedSender<CallResult>,
) {
    if let Err(err) = resolve_call(registry, &forward) {
        let _ = results.send(rejected(&forward, err));
        return;
    }

    let call_id = forward.call_id;
    let script = serde_json::to_string(&forward.function_name).and_then(|name| {
        let args = serde_json::to_string(&forward.args)?;
        let args = serde_json::to_string(&args)?;
        Ok(format!("__codecall_invoke({call_id}, {name}, {args});"))
    });
    let script = match script {
        Ok(script) => script,
        Err(e) => {
            let fault = function_fault(&forward.function_name, &e.to_string(), None);
            let _ = results.send(CallResult::error(forward.session_id, call_id, fault));
            return;
        }
    };

    runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<HostState>()
        .in_flight
        .insert(call_id, forward.function_name.clone());
    tracing::debug!(
        session_id = %forward.session_id,
        call_id,
        function = %forward.function_name,
        "invoking function"
    );

    if let Err(e) = runtime.execute_script("[codecall:invoke]", script) {
        let removed = runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<HostState>()
            .in_flight
            .remove(&call_id);
        if removed.is_some() {
            let fault = function_fault(&forward.function_name, &e.to_string(), None);
            let _ = results.send(CallResult::error(forward.session_id, call_id, fault));
        }
    }
}

async fn serve_session(
    mut ctx: SessionContext,
    ready: oneshot::Sender<Result<v8::IsolateHandle, SandboxError>>,
) {
    let session_id = ctx.session_id;
    let mut runtime = match load_runtime(&ctx) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "function host failed to start");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let heap_state = HeapLimitState::install(&mut runtime);
    let isolate = runtime.v8_isolate().thread_safe_handle();
    if ready.send(Ok(isolate)).is_err() {
        drop(runtime);
        drop(heap_state);
        return;
    }
    tracing::debug!(
        session_id = %session_id,
        modules = ctx.registry.modules().len(),
        "function host ready"
    );

    // Once the isolate has been terminated for exceeding its heap it cannot
    // run anything else; every later call fails fast.
    let mut exhausted = false;
    loop {
        let busy = !exhausted && in_flight_count(&runtime) > 0;
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            forward = ctx.forward_rx.recv() => {
                let Some(forward) = forward else { break };
                if exhausted {
                    let fault = function_fault(
                        &forward.function_name,
                        "function host ran out of memory",
                        None,
                    );
                    let _ = ctx.results.send(CallResult::error(session_id, forward.call_id, fault));
                    continue;
                }
                invoke(&mut runtime, &ctx.registry, forward, &ctx.results);
            }
            outcome = runtime.run_event_loop(PollEventLoopOptions::default()), if busy => {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                if heap_state.triggered() {
                    tracing::warn!(session_id = %session_id, "function host hit the heap limit");
                    exhausted = true;
                    fail_in_flight(&runtime, "function host ran out of memory");
                    continue;
                }
                match outcome {
                    Ok(()) => fail_in_flight(&runtime, "returned a promise that never settled"),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %e,
                            "function event loop error"
                        );
                        fail_in_flight(&runtime, &e.to_string());
                    }
                }
            }
        }
    }

    tracing::debug!(
        session_id = %session_id,
        abandoned = in_flight_count(&runtime),
        "function host closed"
    );
    drop(runtime);
    drop(heap_state);
}

/// A Rust function callable from scripts.
pub type NativeFunction = Arc<
    dyn Fn(Vec<Value>, CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// Runs registered Rust async closures.
#[derive(Default, Clone)]
pub struct NativeFunctionHost {
    descriptors: Vec<FunctionDescriptor>,
    functions: HashMap<String, NativeFunction>,
}

impl NativeFunctionHost {
    /// An empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `descriptor.name`.
    ///
    /// The function receives the validated arguments and a token that is
    /// cancelled when the session ends. A later registration under the same
    /// name replaces the implementation; [`registry`](Self::registry)
    /// reports the duplicate descriptor.
    pub fn register<F, Fut>(&mut self, descriptor: FunctionDescriptor, function: F) -> &mut Self
    where
        F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let function: NativeFunction = Arc::new(move |args, cancel| function(args, cancel).boxed());
        self.functions.insert(descriptor.name.clone(), function);
        self.descriptors.push(descriptor);
        self
    }

    /// The registry describing the registered functions.
    pub fn registry(&self) -> Result<Registry, RegistrationError> {
        Registry::from_descriptors(self.descriptors.iter().cloned())
    }
}

impl std::fmt::Debug for NativeFunctionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionHost")
            .field("functions", &self.descriptors.iter().map(|d| &d.name).collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait::async_trait]
impl FunctionHost for NativeFunctionHost {
    async fn open(
        &self,
        session_id: SessionId,
        registry: Arc<Registry>,
        results: mpsc::UnboundedSender<CallResult>,
        cancel: CancellationToken,
    ) -> Result<HostSession, SandboxError> {
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<CallForward>();
        let functions = self.functions.clone();
        let session_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut calls = JoinSet::new();
            loop {
                tokio::select! {
                    biased;
                    _ = session_cancel.cancelled() => break,
                    Some(_) = calls.join_next(), if !calls.is_empty() => {}
                    forward = forward_rx.recv() => {
                        let Some(forward) = forward else { break };
                        if let Err(err) = resolve_call(&registry, &forward) {
                            let _ = results.send(rejected(&forward, err));
                            continue;
                        }
                        let Some(function) = functions.get(&forward.function_name).cloned() else {
                            let fault = function_fault(
                                &forward.function_name,
                                "no implementation registered",
                                None,
                            );
                            let _ = results.send(CallResult::error(
                                session_id,
                                forward.call_id,
                                fault,
                            ));
                            continue;
                        };
                        let results = results.clone();
                        let token = session_cancel.child_token();
                        calls.spawn(async move {
                            let CallForward { call_id, function_name, args, .. } = forward;
                            let run = async move { function(args, token).await };
                            let outcome = AssertUnwindSafe(run).catch_unwind().await;
                            let result = match outcome {
                                Ok(Ok(value)) => CallResult::value(session_id, call_id, value),
                                Ok(Err(e)) => CallResult::error(
                                    session_id,
                                    call_id,
                                    function_fault(&function_name, &format!("{e:#}"), None),
                                ),
                                Err(_) => CallResult::error(
                                    session_id,
                                    call_id,
                                    function_fault(&function_name, "function panicked", None),
                                ),
                            };
                            let _ = results.send(result);
                        });
                    }
                }
            }
            calls.shutdown().await;
            tracing::debug!(session_id = %session_id, "native host closed");
        });

        Ok(HostSession {
            forward: forward_tx,
            cancel,
            isolate: None,
        })
    }
}
