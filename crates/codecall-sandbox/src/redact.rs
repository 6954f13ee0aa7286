//! Error redaction for function faults.
//!
//! Function implementations run with real credentials and real paths. Their
//! error messages are scrubbed of URLs, addresses, file paths, credentials,
//! and stack frames before they cross into the untrusted script context,
//! while keeping the function name and the human-readable cause.

use std::sync::LazyLock;

use codecall_error::{ErrorKind, ErrorPayload};
use regex::Regex;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[a-zA-Z][a-zA-Z0-9+.\-]*://[^\s'")\]}>]+"#).unwrap());

static IP_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?\b").unwrap());

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot|snap|nix|private)(/[\w.\-]+)+",
    )
    .unwrap()
});

static WINDOWS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]:\\[\w.\\\-]+").unwrap());

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|Basic\s+[A-Za-z0-9+/=]{8,}|(api[_-]?key|token|password|passwd|secret)\s*[=:]\s*\S+)",
    )
    .unwrap()
});

/// AWS access key IDs.
static AWS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}").unwrap());

/// PEM-encoded private keys.
static PEM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-----BEGIN[A-Z\s]+PRIVATE KEY-----[\s\S]*?-----END[A-Z\s]+PRIVATE KEY-----")
        .unwrap()
});

/// GitHub and Slack style tokens.
static VENDOR_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:ghp_|gho_|ghs_|ghr_|github_pat_|xox[abpr]-)[a-zA-Z0-9_\-]{20,}").unwrap()
});

/// Long hex strings that look like keys.
static HEX_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{64,}\b").unwrap());

/// JWTs.
static JWT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap()
});

/// V8 stack frames (`    at fn (file:1:2)`).
static STACK_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*at[ \t]+.*:\d+:\d+\)?[ \t]*$").unwrap());

/// Redact sensitive patterns from an error message.
///
/// - URLs and connection strings become `[url]`
/// - IP addresses (with optional port) become `[addr]`
/// - Absolute Unix and Windows paths become `[path]`
/// - Credentials and tokens become `[REDACTED]`
/// - Stack frame lines are removed
pub fn redact_error_message(error: &str) -> String {
    let mut msg = error.to_string();

    // Credentials first: a token may itself contain a URL.
    msg = PEM_KEY_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = JWT_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = AWS_KEY_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = VENDOR_TOKEN_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = HEX_TOKEN_RE.replace_all(&msg, "[REDACTED]").into_owned();
    msg = URL_RE.replace_all(&msg, "[url]").into_owned();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").into_owned();
    msg = WINDOWS_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = STACK_FRAME_RE.replace_all(&msg, "").into_owned();

    msg.lines()
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the `FunctionError` payload for a fault raised by `function`.
///
/// The message is redacted. The stack keeps only its header line once
/// frames are removed, and is dropped when nothing useful is left.
pub fn function_fault(function: &str, message: &str, stack: Option<&str>) -> ErrorPayload {
    let message = redact_error_message(message);
    let stack = stack
        .map(redact_error_message)
        .filter(|s| !s.is_empty() && *s != message);
    ErrorPayload::new(
        ErrorKind::FunctionError,
        format!("function '{function}' failed: {message}"),
    )
    .with_stack(stack)
}
