//! deno_core op definitions and bootstrap scripts.
//!
//! Scripts reach functions by bare name through a `with` scope that turns
//! every identifier that is not already a global into a call stub. A
//! registered function whose name is a script global (`fetch`, `sys`,
//! `console`, `functions`, or a JavaScript builtin such as `JSON`) is
//! shadowed by that global and is only reachable as `functions.<name>` or
//! `codecall.call(name, ...)`. See [`shadowed_names`].
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use codecall_error::{CallError, ErrorKind, ErrorPayload};
use codecall_registry::Registry;
use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::capabilities::{self, CapabilityError, FetchRequest, PermissionProfile, RunRequest};
use crate::channel::{CallId, CallResult, DispatchClient, SessionId};

/// Raw JSON envelope written by the script's settle hook.
pub struct ScriptOutput(pub String);

/// Wakes the executor once the script has settled.
pub struct SettleSignal(pub Arc<Notify>);

/// Bookkeeping for a function host isolate.
pub struct HostState {
    pub session_id: SessionId,
    pub results: mpsc::UnboundedSender<CallResult>,
    /// Calls handed to JavaScript and not yet answered, by id.
    pub in_flight: HashMap<CallId, String>,
}

impl HostState {
    fn answer(&mut self, call_id: CallId, build: impl FnOnce(&str) -> CallResult) {
        let Some(function) = self.in_flight.remove(&call_id) else {
            tracing::warn!(
                session_id = %self.session_id,
                call_id,
                "function answered a call that is not in flight"
            );
            return;
        };
        if self.results.send(build(&function)).is_err() {
            tracing::debug!(session_id = %self.session_id, call_id, "result channel closed");
        }
    }
}

fn caps_error(err: CapabilityError) -> JsErrorBox {
    match err {
        CapabilityError::PermissionDenied(denied) => {
            JsErrorBox::generic(format!("PermissionDenied: {denied}"))
        }
        other => JsErrorBox::generic(other.to_string()),
    }
}

fn profile(op_state: &Rc<RefCell<OpState>>) -> PermissionProfile {
    op_state.borrow().borrow::<PermissionProfile>().clone()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, JsErrorBox> {
    serde_json::to_string(value)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

// --- capability ops, present in both contexts ---

#[op2(async)]
#[string]
pub async fn op_codecall_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] request_json: String,
) -> Result<String, JsErrorBox> {
    let request: FetchRequest = serde_json::from_str(&request_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid fetch request: {e}")))?;
    let profile = profile(&op_state);
    tracing::debug!(profile = %profile.kind(), url = %request.url, "fetch");
    let response = capabilities::fetch(&profile, request).await.map_err(caps_error)?;
    to_json(&response)
}

#[op2(async)]
#[string]
pub async fn op_codecall_read_file(
    op_state: Rc<RefCell<OpState>>,
    #[string] path: String,
) -> Result<String, JsErrorBox> {
    let profile = profile(&op_state);
    capabilities::read_text_file(&profile, &path)
        .await
        .map_err(caps_error)
}

#[op2(async)]
pub async fn op_codecall_write_file(
    op_state: Rc<RefCell<OpState>>,
    #[string] path: String,
    #[string] data: String,
) -> Result<(), JsErrorBox> {
    let profile = profile(&op_state);
    capabilities::write_text_file(&profile, &path, &data)
        .await
        .map_err(caps_error)
}

/// Returns the variable as JSON: a string, or `null` when unset.
#[op2]
#[string]
pub fn op_codecall_env(state: &mut OpState, #[string] name: &str) -> Result<String, JsErrorBox> {
    let profile = state.borrow::<PermissionProfile>();
    let value = capabilities::env_var(profile, name).map_err(caps_error)?;
    to_json(&value)
}

#[op2(async)]
#[string]
pub async fn op_codecall_run(
    op_state: Rc<RefCell<OpState>>,
    #[string] request_json: String,
) -> Result<String, JsErrorBox> {
    let request: RunRequest = serde_json::from_str(&request_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid run request: {e}")))?;
    let profile = profile(&op_state);
    tracing::debug!(profile = %profile.kind(), cmd = %request.cmd, "run");
    let output = capabilities::run(&profile, request).await.map_err(caps_error)?;
    to_json(&output)
}

// --- script context ops ---

/// Log a message from script code.
#[op2(fast)]
pub fn op_codecall_log(#[string] msg: &str) {
    tracing::info!(target: "codecall::sandbox::script", "{}", msg);
}

/// Store the settled envelope and wake the executor.
#[op2(fast)]
pub fn op_codecall_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ScriptOutput(json.to_string()));
    if let Some(signal) = state.try_borrow::<SettleSignal>() {
        signal.0.notify_one();
    }
}

/// Issue one call through the session's [`DispatchClient`].
///
/// Always resolves, with `{"ok": value}` or `{"error": payload}`. The
/// bootstrap turns the latter into a rejected `CallError`.
#[op2(async)]
#[string]
pub async fn op_codecall_call(
    op_state: Rc<RefCell<OpState>>,
    #[string] function: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    let client = op_state.borrow().borrow::<DispatchClient>().clone();
    let outcome = match serde_json::from_str::<Vec<Value>>(&args_json) {
        Ok(args) => match client.call(&function, args) {
            Ok(handle) => handle.await,
            Err(e) => Err(e.to_payload()),
        },
        // Includes values nested past serde_json's recursion limit.
        Err(e) => Err(CallError::InvalidArguments {
            function,
            reason: format!("arguments are not readable JSON: {e}"),
        }
        .to_payload()),
    };
    let envelope = match outcome {
        Ok(value) => serde_json::json!({ "ok": value }),
        Err(payload) => serde_json::json!({ "error": payload }),
    };
    to_json(&envelope)
}

// --- function host ops ---

/// Log a message from function code.
#[op2(fast)]
pub fn op_codecall_function_log(#[string] msg: &str) {
    tracing::info!(target: "codecall::host::function", "{}", msg);
}

/// A function returned; `json` is its serialized value.
#[op2(fast)]
pub fn op_codecall_return(state: &mut OpState, #[smi] call_id: u32, #[string] json: &str) {
    let host = state.borrow_mut::<HostState>();
    let session_id = host.session_id;
    let parsed = serde_json::from_str::<Value>(json);
    host.answer(call_id, |function| match parsed {
        Ok(value) => CallResult::value(session_id, call_id, value),
        Err(e) => CallResult::error(
            session_id,
            call_id,
            ErrorPayload::new(
                ErrorKind::FunctionError,
                format!("function '{function}' returned an unreadable value: {e}"),
            ),
        ),
    });
}

/// A function threw or returned a rejected promise.
#[op2(fast)]
pub fn op_codecall_fail(
    state: &mut OpState,
    #[smi] call_id: u32,
    #[string] message: &str,
    #[string] stack: &str,
) {
    let host = state.borrow_mut::<HostState>();
    let session_id = host.session_id;
    let stack = (!stack.is_empty()).then_some(stack);
    host.answer(call_id, |function| {
        CallResult::error(
            session_id,
            call_id,
            crate::redact::function_fault(function, message, stack),
        )
    });
}

deno_core::extension!(
    codecall_caps_ext,
    ops = [
        op_codecall_fetch,
        op_codecall_read_file,
        op_codecall_write_file,
        op_codecall_env,
        op_codecall_run
    ],
);

deno_core::extension!(
    codecall_sandbox_ext,
    ops = [op_codecall_log, op_codecall_set_result, op_codecall_call],
);

deno_core::extension!(
    codecall_host_ext,
    ops = [
        op_codecall_function_log,
        op_codecall_return,
        op_codecall_fail
    ],
);

/// `fetch` and `sys.*`, gated by the context's profile. Denials surface
/// as `PermissionDenied` errors.
pub(crate) const CAPABILITIES_JS: &str = r#"
((ops) => {
    const PREFIX = 'PermissionDenied: ';
    class PermissionDenied extends Error {
        constructor(message) {
            super(message);
            this.name = 'PermissionDenied';
        }
    }
    const rethrow = (err) => {
        const message = err && typeof err.message === 'string' ? err.message : '';
        if (message.startsWith(PREFIX)) {
            throw new PermissionDenied(message.slice(PREFIX.length));
        }
        throw err;
    };
    const guard = async (op) => {
        try {
            return await op();
        } catch (err) {
            rethrow(err);
        }
    };

    const fetch = async (input, init) => {
        init = init || {};
        const request = {
            url: String(input),
            method: init.method === undefined ? undefined : String(init.method),
            headers: init.headers || {},
            body: init.body === undefined ? undefined : String(init.body),
        };
        const response = JSON.parse(
            await guard(() => ops.op_codecall_fetch(JSON.stringify(request)))
        );
        return Object.freeze({
            status: response.status,
            ok: response.status >= 200 && response.status < 300,
            headers: Object.freeze(response.headers),
            text: async () => response.body,
            json: async () => JSON.parse(response.body),
        });
    };

    const sys = Object.freeze({
        readTextFile: (path) => guard(() => ops.op_codecall_read_file(String(path))),
        writeTextFile: (path, data) =>
            guard(() => ops.op_codecall_write_file(String(path), String(data))),
        env: (name) => {
            try {
                return JSON.parse(ops.op_codecall_env(String(name)));
            } catch (err) {
                rethrow(err);
            }
        },
        run: async (cmd, args, opts) => {
            const request = {
                cmd: String(cmd),
                args: Array.from(args || [], String),
                cwd: opts && opts.cwd !== undefined ? String(opts.cwd) : undefined,
            };
            return JSON.parse(await guard(() => ops.op_codecall_run(JSON.stringify(request))));
        },
    });

    const fixed = (value) => ({ value, writable: false, configurable: false, enumerable: false });
    Object.defineProperty(globalThis, 'fetch', fixed(fetch));
    Object.defineProperty(globalThis, 'sys', fixed(sys));
    Object.defineProperty(globalThis, 'PermissionDenied', fixed(PermissionDenied));
})(Deno.core.ops);
"#;

/// The script-facing API: `functions`, `codecall`, `CallError`, and the
/// scope and settle hooks used by the prepared script wrapper.
pub(crate) const SANDBOX_PRELUDE_JS: &str = r#"
((ops) => {
    const callOp = ops.op_codecall_call;
    const setResult = (json) => ops.op_codecall_set_result(json);
    const describe = (value) => {
        if (typeof value === 'string') return value;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            try {
                return String(value);
            } catch (_) {
                return '[unprintable]';
            }
        }
    };
    const log = (...parts) => ops.op_codecall_log(parts.map(describe).join(' '));
    const messageOf = (err) => {
        try {
            return String(err);
        } catch (_) {
            return '[unprintable error]';
        }
    };

    class CallError extends Error {
        constructor(payload) {
            super(payload.message);
            this.name = 'CallError';
            this.kind = payload.kind;
            if (payload.suggestion !== undefined) this.suggestion = payload.suggestion;
            if (payload.stack !== undefined) this.functionStack = payload.stack;
        }
    }

    const call = async (name, ...args) => {
        while (args.length > 0 && args[args.length - 1] === undefined) args.pop();
        const reply = JSON.parse(await callOp(String(name), JSON.stringify(args)));
        if (reply.error !== undefined) throw new CallError(reply.error);
        return reply.ok;
    };
    const stub = (name) => (...args) => call(name, ...args);

    const functions = new Proxy(Object.create(null), {
        get(_target, key) {
            if (typeof key !== 'string' || key === 'then') return undefined;
            return stub(key);
        },
        has(_target, key) {
            return typeof key === 'string';
        },
        set() {
            return false;
        },
        defineProperty() {
            return false;
        },
    });

    // Free identifiers in the script resolve here first. Anything that is
    // not a global becomes a function stub; assignments stay local.
    const scope = new Proxy(Object.create(null), {
        has(target, key) {
            if (typeof key !== 'string') return false;
            return key in target || !(key in globalThis);
        },
        get(target, key) {
            if (typeof key !== 'string') return undefined;
            if (key in target) return target[key];
            return stub(key);
        },
    });

    const waitAll = (handles) => Promise.all(handles);
    const waitAny = (handles) =>
        Promise.race(
            Array.from(handles, (handle, index) =>
                Promise.resolve(handle).then((value) => ({ index, value }))
            )
        );

    const classify = (err) => {
        if (err instanceof CallError) {
            const out = { kind: err.kind, message: err.message };
            if (err.suggestion !== undefined) out.suggestion = err.suggestion;
            if (err.functionStack !== undefined) out.stack = err.functionStack;
            return out;
        }
        if (err instanceof Error) {
            const out = { kind: 'ScriptError', message: messageOf(err) };
            if (typeof err.stack === 'string') out.stack = err.stack;
            return out;
        }
        return { kind: 'ScriptError', message: 'uncaught ' + describe(err) };
    };

    let settled = false;
    const finish = (envelope) => {
        if (settled) return;
        settled = true;
        let json;
        try {
            json = JSON.stringify(envelope);
        } catch (err) {
            json = JSON.stringify({
                error: {
                    kind: 'ScriptError',
                    message: 'result is not JSON-serializable: ' + messageOf(err),
                },
            });
        }
        setResult(json);
    };
    const settle = (fn) => {
        Promise.resolve()
            .then(fn)
            .then(
                (value) => finish({ ok: value === undefined ? null : value }),
                (err) => finish({ error: classify(err) })
            );
    };

    const fixed = (value) => ({ value, writable: false, configurable: false, enumerable: false });
    Object.defineProperty(globalThis, 'codecall', fixed(Object.freeze({
        call,
        waitAll,
        waitAny,
        log,
        CallError,
        __scope: scope,
        __settle: settle,
    })));
    Object.defineProperty(globalThis, 'functions', fixed(functions));
    Object.defineProperty(globalThis, 'CallError', fixed(CallError));
    globalThis.console = Object.freeze({ log, info: log, warn: log, error: log, debug: log });
})(Deno.core.ops);
"#;

/// Remove `Deno` and the code generation primitives from the script context.
pub(crate) const HARDEN_JS: &str = r#"
(() => {
    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
        Object.defineProperty(ctor.prototype, 'constructor', {
            value: undefined, configurable: false, writable: false
        });
    }
})();
"#;

/// Globals of the script context that win over a bare function name.
const SCRIPT_GLOBALS: &[&str] = &[
    "fetch",
    "sys",
    "console",
    "functions",
    "codecall",
    "CallError",
    "PermissionDenied",
    "globalThis",
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Symbol",
    "BigInt",
    "Math",
    "JSON",
    "Date",
    "RegExp",
    "Error",
    "Promise",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "Proxy",
    "Reflect",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURIComponent",
    "decodeURIComponent",
    "queueMicrotask",
];

/// Registered names that a script cannot call by bare name.
pub fn shadowed_names(registry: &Registry) -> Vec<&str> {
    registry
        .names()
        .filter(|name| SCRIPT_GLOBALS.contains(name))
        .collect()
}

/// Function table and invocation entry point for the host isolate.
pub(crate) const HOST_PRELUDE_JS: &str = r#"
((ops) => {
    const table = new Map();
    const describe = (value) => {
        if (typeof value === 'string') return value;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    };
    const log = (...parts) => ops.op_codecall_function_log(parts.map(describe).join(' '));

    globalThis.__codecall_register_module = (path, names) => {
        const described = new Set(names);
        return (exports) => {
            for (const [name, value] of Object.entries(exports)) {
                if (described.has(name) && typeof value === 'function') table.set(name, value);
            }
        };
    };

    globalThis.__codecall_invoke = (id, name, argsJson) => {
        const fail = (err) => {
            const message = err instanceof Error ? String(err.message) : describe(err);
            const stack = err instanceof Error && typeof err.stack === 'string' ? err.stack : '';
            ops.op_codecall_fail(id, message, stack);
        };
        const fn = table.get(name);
        if (fn === undefined) {
            ops.op_codecall_fail(id, 'function is not loaded', '');
            return;
        }
        let args;
        try {
            args = JSON.parse(argsJson);
        } catch (err) {
            fail(err);
            return;
        }
        Promise.resolve()
            .then(() => fn(...args))
            .then((value) => {
                let json;
                try {
                    json = JSON.stringify(value === undefined ? null : value);
                } catch (err) {
                    fail(new Error('return value is not JSON-serializable: ' + err.message));
                    return;
                }
                ops.op_codecall_return(id, json === undefined ? 'null' : json);
            }, fail);
    };

    globalThis.log = log;
    globalThis.console = Object.freeze({ log, info: log, warn: log, error: log, debug: log });
    delete globalThis.Deno;
})(Deno.core.ops);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use codecall_registry::{FunctionDescriptor, TypeTree};

    #[test]
    fn shadowed_names_lists_script_globals() {
        let registry = Registry::from_descriptors(
            ["fetch", "double", "JSON"]
                .map(|name| FunctionDescriptor::new(name, vec![], TypeTree::unknown(), "native")),
        )
        .unwrap();
        assert_eq!(shadowed_names(&registry), ["JSON", "fetch"]);
    }

    #[test]
    fn permission_denials_carry_the_js_prefix() {
        let denied = PermissionProfile::sandbox().check_env("HOME").unwrap_err();
        let err = caps_error(CapabilityError::from(denied));
        assert!(err.to_string().contains("PermissionDenied: env access"), "{err}");
    }

    #[test]
    fn other_capability_errors_pass_through() {
        let err = caps_error(CapabilityError::Invalid("bad url".into()));
        assert!(err.to_string().contains("invalid request: bad url"));
        assert!(!err.to_string().contains("PermissionDenied"));
    }

    #[test]
    fn host_state_answers_each_call_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut host = HostState {
            session_id: SessionId(3),
            results: tx,
            in_flight: HashMap::from([(7, "double".to_string())]),
        };
        host.answer(7, |f| {
            assert_eq!(f, "double");
            CallResult::value(SessionId(3), 7, serde_json::json!(42))
        });
        host.answer(7, |_| panic!("second answer must be ignored"));
        let result = rx.try_recv().unwrap();
        assert_eq!(result.call_id, 7);
        assert!(rx.try_recv().is_err());
    }
}
