//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `config` | `Config`         |
//! | `status` | `Status`         |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::cmd_run;
pub use status::cmd_status;

use anyhow::{Context, Result};
use quill::config::QuillConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use super::Cli;

/// Audit records live under this directory inside the output directory.
pub const AUDIT_SUBDIR: &str = "audit";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// Stderr stays quiet unless `--verbose` so it does not fight the progress
/// bar. The returned guard flushes the log file on drop.
pub fn init_tracing(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let stderr_default = if cli.verbose { "quill=debug,warn" } else { "warn" };
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr_layer = if cli.json_logs {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(stderr_default))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter(stderr_default))
            .boxed()
    };
    layers.push(stderr_layer);

    let mut guard = None;
    if let Some(path) = &cli.log_file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

        let appender = tracing_appender::rolling::never(&dir, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(env_filter("quill=info,warn"))
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

/// Discover the config file and apply environment overrides.
pub fn load_config(cli: &Cli) -> Result<(QuillConfig, Option<PathBuf>)> {
    let (mut config, source) = QuillConfig::discover(cli.config.as_deref())?;
    config.apply_env()?;
    Ok((config, source))
}
