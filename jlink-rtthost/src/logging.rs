use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};
use tracing::level_filters::LevelFilter as TracingLevel;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Keeps the file log flushing until the host exits.
pub struct LogFileGuard<'a> {
    _worker: WorkerGuard,
    path: &'a Path,
}

impl Drop for LogFileGuard<'_> {
    fn drop(&mut self) {
        tracing::info!("Wrote log to {}", self.path.display());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[clap(rename_all = "UPPER")]
#[serde(rename_all = "UPPERCASE")]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for TracingLevel {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => TracingLevel::OFF,
            LevelFilter::Error => TracingLevel::ERROR,
            LevelFilter::Warn => TracingLevel::WARN,
            LevelFilter::Info => TracingLevel::INFO,
            LevelFilter::Debug => TracingLevel::DEBUG,
            LevelFilter::Trace => TracingLevel::TRACE,
        }
    }
}

/// Builds the filter for terminal output.
///
/// A configured level wins over `RUST_LOG`; without one, `RUST_LOG` applies
/// on top of a `WARN` default.
fn terminal_filter(level: Option<LevelFilter>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(TracingLevel::from(level).into())
            .parse_lossy(""),
        None => EnvFilter::builder()
            .with_default_directive(TracingLevel::WARN.into())
            .from_env_lossy(),
    }
}

/// Installs the global tracing subscriber.
///
/// Terminal output goes to stderr, stdout carries the RTT data. With a
/// `log_path`, every event including the driver's own messages is also
/// written to that file as JSON lines.
pub fn setup_logging(
    log_path: Option<&Path>,
    level: Option<LevelFilter>,
) -> anyhow::Result<Option<LogFileGuard<'_>>> {
    let terminal = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter(level));

    let Some(path) = log_path else {
        tracing_subscriber::registry().with(terminal).init();
        return Ok(None);
    };

    let (writer, worker) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(File::create(path)?);

    let file = tracing_subscriber::fmt::layer()
        .json()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(writer)
        .with_filter(TracingLevel::TRACE);

    tracing_subscriber::registry().with(terminal).with(file).init();
    tracing::info!("Writing log to {}", path.display());

    Ok(Some(LogFileGuard {
        _worker: worker,
        path,
    }))
}
