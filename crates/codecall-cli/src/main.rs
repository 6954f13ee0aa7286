#![warn(missing_docs)]

//! codecall runtime
//!
//! Discovers functions under a source root and serves `discover` and
//! `execute` over TCP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use codecall_config::CodecallConfig;
use codecall_registry::watcher::RegistryWatcher;
use codecall_registry::{LiveRegistry, Registry};
use codecall_sandbox::audit::TracingAuditLogger;
use codecall_sandbox::capabilities::{Grant, PermissionProfile};
use codecall_sandbox::{SandboxConfig, SandboxEngine, ScriptFunctionHost};
use codecall_server::metrics::{CodecallMetrics, MetricsAuditLogger};
use codecall_server::{CodecallService, CoordinatorConfig, OverflowPolicy};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:7420";

/// How often the session gauges are refreshed.
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &codecall_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(timeout) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(timeout);
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(kb) = overrides.max_code_kb {
        config.max_code_size = kb * 1024;
    }
    if let Some(calls) = overrides.max_calls {
        config.max_calls = calls;
    }
    if let Some(kb) = overrides.max_args_kb {
        config.max_args_size = kb * 1024;
    }
    if let Some(kb) = overrides.max_result_kb {
        config.max_result_size = kb * 1024;
    }
    if let Some(kb) = overrides.max_output_kb {
        config.max_output_size = kb * 1024;
    }
    if let Some(depth) = overrides.max_depth {
        config.max_depth = depth;
    }
    config
}

/// Build CoordinatorConfig from session overrides.
fn build_coordinator_config(overrides: &codecall_config::SessionOverrides) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    if let Some(max) = overrides.max_concurrent {
        config.max_concurrent = max;
    }
    if let Some(policy) = overrides.overflow {
        config.overflow = match policy {
            codecall_config::OverflowPolicy::Queue => OverflowPolicy::Queue,
            codecall_config::OverflowPolicy::Reject => OverflowPolicy::Reject,
        };
    }
    if let Some(retained) = overrides.retained {
        config.retained = retained;
    }
    config
}

/// The capability profile functions run with.
fn build_function_profile(p: &codecall_config::PermissionsConfig) -> PermissionProfile {
    PermissionProfile::function(
        Grant::from_list(p.net.as_deref()),
        Grant::from_list(p.read.as_deref()),
        Grant::from_list(p.write.as_deref()),
        Grant::from_list(p.env.as_deref()),
        Grant::from_list(p.run.as_deref()),
    )
}

/// Locate the config file.
///
/// Search order:
/// 1. `CODECALL_CONFIG` environment variable
/// 2. `./codecall.toml` in the current directory
/// 3. None (defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CODECALL_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("codecall.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config() -> Result<CodecallConfig> {
    match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            CodecallConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(CodecallConfig::from_toml("")?)
        }
    }
}

fn load_registry(config: &CodecallConfig) -> Result<LiveRegistry> {
    let Some(root) = config.functions.root.as_ref() else {
        tracing::warn!("no [functions] root configured, serving an empty registry");
        return Ok(LiveRegistry::new(Registry::empty()));
    };
    let live = LiveRegistry::discover(root)
        .with_context(|| format!("failed to register functions under {}", root.display()))?;
    let current = live.current();
    tracing::info!(
        root = %root.display(),
        functions = current.len(),
        modules = current.modules().len(),
        "functions registered"
    );
    Ok(live)
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|a| a == "--version" || a == "-V") {
        println!("codecall {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    let live = load_registry(&config)?;

    let watcher = if config.functions.watch.unwrap_or(false) && live.root().is_some() {
        Some(RegistryWatcher::new(live.clone())?.start())
    } else {
        None
    };

    let sandbox_config = build_sandbox_config(&config.sandbox);
    let host = ScriptFunctionHost::new(build_function_profile(&config.permissions))
        .with_max_heap_size(sandbox_config.max_heap_size);

    let mut prometheus = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(CodecallMetrics::new(&mut prometheus));
    let audit = Arc::new(MetricsAuditLogger::new(
        metrics.clone(),
        Arc::new(TracingAuditLogger),
    ));

    let engine = SandboxEngine::new(sandbox_config, live, Arc::new(host)).with_audit_logger(audit);
    let mut service = CodecallService::new(engine, build_coordinator_config(&config.sessions));
    if let Some(mb) = config.server.max_frame_mb {
        service = service.with_max_frame_size(mb * 1024 * 1024);
    }
    let service = Arc::new(service);

    let listen = config.server.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let shutdown = CancellationToken::new();
    let gauges = {
        let coordinator = service.coordinator().clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            loop {
                interval.tick().await;
                metrics.observe(&coordinator);
            }
        })
    };

    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received shutdown signal, stopping gracefully");
            }
            shutdown.cancel();
        })
    };

    service.clone().serve(listener, shutdown).await?;

    gauges.abort();
    signal.abort();
    if let Some(handle) = watcher {
        handle.abort();
    }

    metrics.observe(service.coordinator());
    let mut text = String::new();
    if prometheus_client::encoding::text::encode(&mut text, &prometheus).is_ok() {
        tracing::debug!(metrics = %text, "final metrics");
    }

    Ok(())
}
