use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::Level;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

/// Connection-level crates that are chatty at `debug` and below.
const QUIET_TARGETS: [&str; 3] = ["h2", "hyper_util", "tower"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("Invalid log format: {other}")),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Output goes to stderr, or is
/// appended to `file_path`, so stdout carries only command output.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let format: LogFormat = config.format.parse()?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(&config.level)?)?,
    };

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(false)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Filter directives for `level`, with transport internals capped at `warn`
/// unless the level is already stricter.
fn default_directives(level: &str) -> anyhow::Result<String> {
    let level = Level::from_str(level.trim()).map_err(|_| anyhow!("Invalid log level: {level}"))?;
    let mut directives = vec![level.as_str().to_ascii_lowercase()];
    if level > Level::WARN {
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    }
    Ok(directives.join(","))
}
