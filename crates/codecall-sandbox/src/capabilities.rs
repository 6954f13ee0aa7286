//! Permission profiles and the capability operations they gate.
//!
//! Exactly two profiles exist. The *sandbox* profile, attached to every
//! script context, grants network access only. The *function* profile,
//! attached to the privileged context, grants whatever the runtime was
//! configured with. Profiles attach to contexts, never to individual calls.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest response body `fetch` will buffer.
const MAX_FETCH_BODY: usize = 16 * 1024 * 1024;

/// Which of the two fixed profiles this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Untrusted script context.
    Sandbox,
    /// Privileged function context.
    Function,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sandbox => f.write_str("sandbox"),
            Self::Function => f.write_str("function"),
        }
    }
}

/// One category of capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Outbound HTTP.
    Net,
    /// Reading files.
    Read,
    /// Writing files.
    Write,
    /// Reading environment variables.
    Env,
    /// Spawning processes.
    Run,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Net => "net",
            Self::Read => "read",
            Self::Write => "write",
            Self::Env => "env",
            Self::Run => "run",
        })
    }
}

/// What a profile grants within one capability category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Everything.
    All,
    /// Nothing.
    Denied,
    /// Only the listed hosts, path prefixes, variables, or programs.
    Only(Vec<String>),
}

impl Grant {
    /// Build a grant from a configured allowlist. `None` and `"*"` grant
    /// everything; an empty list grants nothing.
    pub fn from_list(list: Option<&[String]>) -> Self {
        match list {
            None => Self::All,
            Some(entries) if entries.iter().any(|e| e == "*") => Self::All,
            Some([]) => Self::Denied,
            Some(entries) => Self::Only(entries.to_vec()),
        }
    }

    fn allows(&self, matches: impl Fn(&str) -> bool) -> bool {
        match self {
            Self::All => true,
            Self::Denied => false,
            Self::Only(entries) => entries.iter().any(|e| matches(e)),
        }
    }
}

/// A capability request was refused by the context's profile.
#[derive(Debug, Clone, Error)]
#[error("{capability} access to '{target}' is not permitted in the {profile} context")]
pub struct PermissionDenied {
    /// The refusing profile.
    pub profile: ProfileKind,
    /// The requested capability.
    pub capability: Capability,
    /// Host, path, variable, or program requested.
    pub target: String,
}

/// Failure of a capability operation.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The profile refused the request.
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),
    /// The request was malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Filesystem or process failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// HTTP failure.
    #[error("fetch failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// The capability set attached to an execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionProfile {
    kind: ProfileKind,
    net: Grant,
    read: Grant,
    write: Grant,
    env: Grant,
    run: Grant,
}

impl PermissionProfile {
    /// The script context profile: any host over HTTP, nothing else.
    pub fn sandbox() -> Self {
        Self {
            kind: ProfileKind::Sandbox,
            net: Grant::All,
            read: Grant::Denied,
            write: Grant::Denied,
            env: Grant::Denied,
            run: Grant::Denied,
        }
    }

    /// A function context profile granting everything.
    pub fn function_full() -> Self {
        Self::function(Grant::All, Grant::All, Grant::All, Grant::All, Grant::All)
    }

    /// A function context profile with explicit grants.
    pub fn function(net: Grant, read: Grant, write: Grant, env: Grant, run: Grant) -> Self {
        Self {
            kind: ProfileKind::Function,
            net,
            read,
            write,
            env,
            run,
        }
    }

    /// Which profile this is.
    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    fn deny(&self, capability: Capability, target: &str) -> PermissionDenied {
        PermissionDenied {
            profile: self.kind,
            capability,
            target: target.to_string(),
        }
    }

    /// Check outbound access to `host` (and `port`, if given).
    ///
    /// Entries match a host exactly, `host:port`, or a `*.suffix` wildcard.
    pub fn check_net(&self, host: &str, port: Option<u16>) -> Result<(), PermissionDenied> {
        let host = host.to_ascii_lowercase();
        let with_port = port.map(|p| format!("{host}:{p}"));
        let allowed = self.net.allows(|entry| {
            let entry = entry.to_ascii_lowercase();
            if let Some(suffix) = entry.strip_prefix("*.") {
                return host.ends_with(&format!(".{suffix}"));
            }
            entry == host || with_port.as_deref() == Some(entry.as_str())
        });
        if allowed {
            Ok(())
        } else {
            Err(self.deny(Capability::Net, &host))
        }
    }

    /// Check read access to `path`.
    pub fn check_read(&self, path: &Path) -> Result<(), PermissionDenied> {
        self.check_path(&self.read, Capability::Read, path)
    }

    /// Check write access to `path`.
    pub fn check_write(&self, path: &Path) -> Result<(), PermissionDenied> {
        self.check_path(&self.write, Capability::Write, path)
    }

    fn check_path(
        &self,
        grant: &Grant,
        capability: Capability,
        path: &Path,
    ) -> Result<(), PermissionDenied> {
        let display = path.display().to_string();
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(self.deny(capability, &display));
        }
        if grant.allows(|prefix| path.starts_with(prefix)) {
            Ok(())
        } else {
            Err(self.deny(capability, &display))
        }
    }

    /// Check access to environment variable `name`.
    pub fn check_env(&self, name: &str) -> Result<(), PermissionDenied> {
        if self.env.allows(|entry| entry == name) {
            Ok(())
        } else {
            Err(self.deny(Capability::Env, name))
        }
    }

    /// Check permission to spawn `program`.
    ///
    /// Entries match the program as given or its file name.
    pub fn check_run(&self, program: &str) -> Result<(), PermissionDenied> {
        let file_name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if self.run.allows(|entry| entry == program || entry == file_name) {
            Ok(())
        } else {
            Err(self.deny(Capability::Run, program))
        }
    }
}

/// `fetch` request as sent by script or function code.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
    /// Absolute `http` or `https` URL.
    pub url: String,
    /// HTTP method, `GET` by default.
    #[serde(default)]
    pub method: Option<String>,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Option<String>,
}

/// `fetch` response handed back to script or function code.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers. Repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    /// Response body as text.
    pub body: String,
}

/// Perform an HTTP request if the profile allows the target host.
pub async fn fetch(
    profile: &PermissionProfile,
    request: FetchRequest,
) -> Result<FetchResponse, CapabilityError> {
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| CapabilityError::Invalid(format!("bad url '{}': {e}", request.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CapabilityError::Invalid(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| CapabilityError::Invalid("url has no host".into()))?;
    profile.check_net(host, url.port_or_known_default())?;

    let method = request.method.as_deref().unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| CapabilityError::Invalid(format!("bad method '{method}'")))?;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let mut builder = client.request(method, url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    let response = builder.send().await?;

    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|v: &mut String| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    let bytes = response.bytes().await?;
    if bytes.len() > MAX_FETCH_BODY {
        return Err(CapabilityError::Invalid(format!(
            "response body too large ({} bytes, max {MAX_FETCH_BODY})",
            bytes.len()
        )));
    }
    Ok(FetchResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Read a UTF-8 file if the profile allows it.
pub async fn read_text_file(
    profile: &PermissionProfile,
    path: &str,
) -> Result<String, CapabilityError> {
    let path = Path::new(path);
    profile.check_read(path)?;
    Ok(tokio::fs::read_to_string(path).await?)
}

/// Write a UTF-8 file if the profile allows it.
pub async fn write_text_file(
    profile: &PermissionProfile,
    path: &str,
    data: &str,
) -> Result<(), CapabilityError> {
    let path = Path::new(path);
    profile.check_write(path)?;
    Ok(tokio::fs::write(path, data).await?)
}

/// Read an environment variable if the profile allows it.
pub fn env_var(profile: &PermissionProfile, name: &str) -> Result<Option<String>, CapabilityError> {
    profile.check_env(name)?;
    Ok(std::env::var(name).ok())
}

/// Process spawn request.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    /// Program to run.
    pub cmd: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Result of a finished process.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Run a process to completion if the profile allows it.
pub async fn run(
    profile: &PermissionProfile,
    request: RunRequest,
) -> Result<RunOutput, CapabilityError> {
    profile.check_run(&request.cmd)?;
    let mut command = tokio::process::Command::new(&request.cmd);
    command.args(&request.args).kill_on_drop(true);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    let output = command.output().await?;
    Ok(RunOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
