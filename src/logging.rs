//! Per-Scheduler log routing.
//!
//! A Scheduler owns its own [`Dispatch`] and attaches it to every future it
//! runs, so two Schedulers in one process can log to different places.

use camino::Utf8PathBuf;
use serde::Deserialize;
use tracing::Dispatch;

use crate::error::ConfigError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum LogDestination {
    #[default]
    Stderr,
    File(Utf8PathBuf),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info,tasuki::graph=debug`.
    pub filter: String,
    pub destination: LogDestination,
    pub ansi: bool,
    /// Show running rules as spinners on stderr.
    pub render_ui: bool,
    pub max_ui_workers: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            destination: LogDestination::Stderr,
            ansi: true,
            render_ui: false,
            max_ui_workers: 8,
        }
    }
}

impl LoggingConfig {
    #[cfg(feature = "logging")]
    pub(crate) fn dispatch(&self) -> Result<Dispatch, ConfigError> {
        use std::sync::Arc;

        use tracing_indicatif::IndicatifLayer;
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{EnvFilter, fmt};

        let filter = EnvFilter::try_new(&self.filter)
            .map_err(|err| ConfigError::LogFilter(err.to_string()))?;

        let indicatif = self.render_ui.then(|| {
            IndicatifLayer::new().with_max_progress_bars(self.max_ui_workers.max(1) as u64, None)
        });

        let writer = match (&self.destination, &indicatif) {
            (LogDestination::File(path), _) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| ConfigError::LogDestination {
                        path: path.clone(),
                        source,
                    })?;
                BoxMakeWriter::new(Arc::new(file))
            }
            (LogDestination::Stderr, Some(layer)) => BoxMakeWriter::new(layer.get_stderr_writer()),
            (LogDestination::Stderr, None) => BoxMakeWriter::new(std::io::stderr),
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(self.ansi).with_writer(writer))
            .with(indicatif);

        Ok(Dispatch::new(subscriber))
    }

    #[cfg(not(feature = "logging"))]
    pub(crate) fn dispatch(&self) -> Result<Dispatch, ConfigError> {
        Ok(Dispatch::none())
    }
}
