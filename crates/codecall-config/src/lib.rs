#![warn(missing_docs)]

//! # codecall-config
//!
//! Configuration loading for the codecall runtime.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every setting is optional; the binary fills in defaults for anything
//! left out.
//!
//! ## Example
//!
//! ```toml
//! [functions]
//! root = "./functions"
//! watch = true
//!
//! [server]
//! listen = "127.0.0.1:7420"
//! max_frame_mb = 8
//!
//! [sandbox]
//! timeout_secs = 5
//! max_heap_mb = 64
//! max_calls = 256
//!
//! [sessions]
//! max_concurrent = 8
//! overflow = "queue"
//!
//! [permissions]
//! net = ["api.example.com"]
//! read = ["${HOME}/data"]
//! env = ["API_TOKEN"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level codecall configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodecallConfig {
    /// Where function sources live.
    #[serde(default)]
    pub functions: FunctionsConfig,

    /// Listener settings.
    #[serde(default)]
    pub server: ServerOverrides,

    /// Sandbox execution limits.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Session admission settings.
    #[serde(default)]
    pub sessions: SessionOverrides,

    /// Capabilities granted to function implementations.
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

/// Function source settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionsConfig {
    /// Root directory scanned for exported functions.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Rebuild the registry when sources under the root change.
    #[serde(default)]
    pub watch: Option<bool>,
}

/// Listener overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerOverrides {
    /// Socket address to bind, e.g. `127.0.0.1:7420`.
    #[serde(default)]
    pub listen: Option<String>,

    /// Largest accepted wire frame in megabytes.
    #[serde(default)]
    pub max_frame_mb: Option<usize>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Wall-clock budget per session in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum submitted code size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum function calls per session.
    #[serde(default)]
    pub max_calls: Option<usize>,

    /// Maximum serialized argument size per call in kilobytes.
    #[serde(default)]
    pub max_args_kb: Option<usize>,

    /// Maximum serialized result size per call in kilobytes.
    #[serde(default)]
    pub max_result_kb: Option<usize>,

    /// Maximum serialized session result size in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// Maximum nesting depth of values crossing the channel.
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// What happens to sessions submitted while the runtime is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a slot, in arrival order.
    #[default]
    Queue,
    /// Fail immediately with `Overloaded`.
    Reject,
}

/// Session coordinator overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOverrides {
    /// Maximum concurrently running sessions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Behaviour once `max_concurrent` sessions are running.
    #[serde(default)]
    pub overflow: Option<OverflowPolicy>,

    /// How many finished sessions keep answering `status`.
    #[serde(default)]
    pub retained: Option<usize>,
}

/// Capability grants for the function context.
///
/// Each list is an allowlist; `"*"` grants everything in that category.
/// An absent list grants everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermissionsConfig {
    /// Hosts functions may fetch from.
    #[serde(default)]
    pub net: Option<Vec<String>>,

    /// Path prefixes functions may read.
    #[serde(default)]
    pub read: Option<Vec<String>>,

    /// Path prefixes functions may write.
    #[serde(default)]
    pub write: Option<Vec<String>>,

    /// Environment variables functions may read.
    #[serde(default)]
    pub env: Option<Vec<String>>,

    /// Programs functions may spawn.
    #[serde(default)]
    pub run: Option<Vec<String>>,
}

impl CodecallConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CodecallConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(listen) = &self.server.listen {
            listen.parse::<SocketAddr>().map_err(|e| {
                ConfigError::Invalid(format!("server.listen '{}': {}", listen, e))
            })?;
        }

        let positive = [
            ("server.max_frame_mb", self.server.max_frame_mb),
            ("sandbox.max_heap_mb", self.sandbox.max_heap_mb),
            ("sandbox.max_code_kb", self.sandbox.max_code_kb),
            ("sandbox.max_calls", self.sandbox.max_calls),
            ("sandbox.max_args_kb", self.sandbox.max_args_kb),
            ("sandbox.max_result_kb", self.sandbox.max_result_kb),
            ("sandbox.max_output_kb", self.sandbox.max_output_kb),
            ("sandbox.max_depth", self.sandbox.max_depth),
            ("sessions.max_concurrent", self.sessions.max_concurrent),
        ];
        for (key, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", key)));
            }
        }
        if self.sandbox.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.functions.watch == Some(true) && self.functions.root.is_none() {
            return Err(ConfigError::Invalid(
                "functions.watch requires functions.root".into(),
            ));
        }

        let lists = [
            ("permissions.net", &self.permissions.net),
            ("permissions.read", &self.permissions.read),
            ("permissions.write", &self.permissions.write),
            ("permissions.env", &self.permissions.env),
            ("permissions.run", &self.permissions.run),
        ];
        for (key, list) in lists {
            if let Some(entries) = list {
                if entries.iter().any(|e| e.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "{} contains an empty entry",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
