use std::{fs::File, io, path::PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Keeps the non-blocking log worker alive. Dropping it flushes and stops
/// the worker; the subscriber itself stays installed for the process.
pub struct TelemetryGuard {
    _worker: Option<WorkerGuard>,
}

#[derive(Debug, Default)]
pub struct TelemetryConfig {
    /// Mirror events to the process stderr.
    pub console: bool,

    /// Append pretty-printed output to this file.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file: {0}")]
    LogFile(#[from] io::Error),

    #[error("a tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Installs the process-wide subscriber. Filtering comes from `MARROW_LOG`
/// when set, `info` otherwise.
pub fn install(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter_layer = EnvFilter::try_from_env("MARROW_LOG")
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    let (file_layer, worker) = match &config.log_file {
        Some(path) => {
            let file = File::options().append(true).create(true).open(path)?;
            let (writer, worker) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .pretty()
                .with_ansi(false)
                .without_time()
                .with_writer(writer);

            (Some(layer), Some(worker))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(filter_layer)
        .with(file_layer)
        .with(config.console.then(|| {
            fmt::layer()
                .compact()
                .with_ansi(true)
                .without_time()
                .with_writer(io::stderr)
        }))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInstalled)?;

    Ok(TelemetryGuard { _worker: worker })
}

#[cfg(test)]
mod test {
    use super::{TelemetryConfig, TelemetryError, install};

    #[test]
    fn install_writes_through_the_worker() {
        let path = std::env::temp_dir().join(format!(
            "marrow-telemetry-test-{}.log",
            std::process::id()
        ));

        let guard = install(TelemetryConfig {
            console: false,
            log_file: Some(path.clone()),
        })
        .unwrap();
        tracing::info!("telemetry smoke marker");
        drop(guard);

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(text.contains("telemetry smoke marker"));

        // The subscriber outlives its guard; reinstalling is refused.
        assert!(matches!(
            install(TelemetryConfig::default()),
            Err(TelemetryError::AlreadyInstalled)
        ));
    }
}
