//! ---
//! smi_section: "01-core-functionality"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Process-wide tracing setup with per-service rolling log files."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! Every SMI process logs to stdout and to a daily rolling JSON file under
//! `<logging.directory>/<process name>/`, named after the process and its pid
//! so that several instances of one service can share a log root.
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "SMI_LOG";

static INSTALLED: OnceCell<Installed> = OnceCell::new();

struct Installed {
    target: LogTarget,
    // Flushes the non-blocking writers; lives for the whole process.
    _guards: [WorkerGuard; 2],
}

/// Stdout format of a service. The log file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    StructuredJson,
    /// Human readable lines.
    Pretty,
}

/// Location of a process's rolling log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    /// Per-process directory below the configured log root.
    pub directory: PathBuf,
    /// File name the daily appender suffixes with the date.
    pub file_name: String,
}

impl LogTarget {
    /// Target for `process_name` running as `process_id`.
    ///
    /// `logging.file_prefix` replaces the process name in the file name, not
    /// in the directory.
    pub fn for_process(process_name: &str, process_id: u32, config: &LoggingConfig) -> Self {
        let process_name = sanitise(process_name);
        let stem = config
            .file_prefix
            .as_deref()
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .map(sanitise)
            .unwrap_or_else(|| process_name.clone());
        Self {
            directory: config.directory.join(&process_name),
            file_name: format!("{stem}-{process_id}.log"),
        }
    }
}

fn sanitise(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// `SMI_LOG`, then `RUST_LOG`, then `info`.
fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive {directive:?} ({err}); defaulting to info logging");
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Install the process-wide tracing subscriber for an SMI service.
///
/// Only the first call installs anything; later calls return the target
/// chosen by the first one.
pub fn init_tracing(process_name: &str, process_id: u32, config: &LoggingConfig) -> Result<&'static LogTarget> {
    let installed = INSTALLED.get_or_try_init(|| install(LogTarget::for_process(process_name, process_id, config), config))?;
    Ok(&installed.target)
}

fn install(target: LogTarget, config: &LoggingConfig) -> Result<Installed> {
    std::fs::create_dir_all(&target.directory)
        .with_context(|| format!("could not create log directory {}", target.directory.display()))?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(daily(&target.directory, &target.file_name));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        // A subscriber installed by the embedding application keeps priority.
        eprintln!("tracing subscriber already installed; {} will stay empty ({err})", target.file_name);
    }

    info!(
        log_dir = %target.directory.display(),
        log_file = %target.file_name,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(Installed {
        target,
        _guards: [file_guard, stdout_guard],
    })
}
