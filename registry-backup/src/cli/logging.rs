//! Tracing subscriber setup.
//!
//! `RUST_LOG` overrides `--log-level` when set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use clap::{Args, ValueEnum};
use eyre::WrapErr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub(crate) enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct LogArgs {
    /// Logging level
    #[arg(long, global = true, value_enum, ignore_case = true, default_value = "INFO")]
    log_level: LogLevel,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<Utf8PathBuf>,

    /// Write console logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

pub(crate) fn init(args: &LogArgs) -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive()));

    let console = if args.log_json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    };

    let file = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("opening log file {path}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .wrap_err("installing tracing subscriber")?;

    Ok(())
}
