//! Tracing subscriber setup

use anyhow::Context;
use parlor_config::LogLevel;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resolved logging settings
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Filter directive, e.g. `info` or `parlor_gateway=debug,info`
    pub filter: String,
    pub json: bool,
    /// Daily-rotated log file, in addition to stderr
    pub file: Option<PathBuf>,
}

/// Pick the filter directive: `RUST_LOG` wins over `--log-level`, which
/// wins over the config file.
pub fn resolve_filter(rust_log: Option<&str>, cli_level: Option<&str>, config_level: LogLevel) -> String {
    rust_log
        .filter(|directive| !directive.trim().is_empty())
        .or(cli_level)
        .unwrap_or(config_level.as_str())
        .to_string()
}

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must live as long as the process.
pub fn init_logging(options: &LoggingOptions) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&options.filter)
        .with_context(|| format!("Invalid log filter: {}", options.filter))?;

    let (file_writer, guard) = match &options.file {
        Some(path) => {
            let (directory, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(&directory)
                .with_context(|| format!("Failed to create log directory {:?}", directory))?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if options.json {
        let file_layer = file_writer.map(|writer| {
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
        });
        registry
            .with(fmt::layer().json().with_target(true))
            .with(file_layer)
            .try_init()?;
    } else {
        let file_layer = file_writer.map(|writer| {
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
        });
        registry
            .with(fmt::layer().with_target(true))
            .with(file_layer)
            .try_init()?;
    }

    tracing::info!("Logging initialized with filter: {}", options.filter);
    Ok(guard)
}

fn split_log_path(path: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {:?}", path))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((directory, PathBuf::from(file_name)))
}
