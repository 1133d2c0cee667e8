use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Dispatch;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn default_level() -> String {
    "info".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LogSettings {
    /// Filter directive, overridden by `RUST_LOG` when set.
    #[serde(default = "default_level")]
    pub level: String,
    /// Log file written alongside stdout.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            json: false,
        }
    }
}

/// A subscriber built from settings and handed to whatever needs to log.
/// Nothing is installed globally.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    pub fn new(settings: &LogSettings) -> Result<Self> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
                Error::Config(format!("Invalid log level '{}': {e}", settings.level))
            })?,
        };

        let stdout = if settings.json {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().boxed()
        };

        let file = match &settings.file {
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                let name = path
                    .file_name()
                    .ok_or_else(|| Error::Config(format!("Invalid log file: {}", path.display())))?;
                std::fs::create_dir_all(&dir)?;
                let appender = RollingFileAppender::builder()
                    .rotation(Rotation::NEVER)
                    .filename_prefix(name.to_string_lossy())
                    .build(&dir)
                    .map_err(|e| Error::Config(format!("Unable to open log file: {e}")))?;
                Some(fmt::layer().with_ansi(false).with_writer(appender))
            }
            None => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(stdout)
            .with(file)
            .with(filter);

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
        })
    }

    /// Drops every event.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    pub fn dispatch(self: &Self) -> &Dispatch {
        &self.dispatch
    }

    /// Runs `f` with this logger as the default subscriber.
    pub fn in_scope<T>(self: &Self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}
