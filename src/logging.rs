//! ==============================================================================
//! logging.rs - tracing setup with a runtime-adjustable level
//! ==============================================================================
//!
//! purpose:
//!     installs the global subscriber (console + optional log file) and hands
//!     back a LogHandle so the control bridge can change the level while the
//!     gateway is running.
//!
//! relationships:
//!     - used by: main.rs (init), control.rs (LogLevel, level changes)
//!
//! ==============================================================================

use crate::error::ControlError;

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

pub const LOG_FILE_NAME: &str = "ip_tracker.log";

/// the closed set of levels the platform may request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Off,
    ];

    /// wire name, as sent to and received from the platform
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }

    /// case-insensitive parse for local config and cli input
    pub fn parse_relaxed(s: &str) -> Result<Self, ControlError> {
        s.trim().to_uppercase().parse()
    }
}

impl FromStr for LogLevel {
    type Err = ControlError;

    /// exact wire names only; anything else is an invalid remote level
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ControlError::InvalidLevel(s.to_string()))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// changes the global level after init
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<LevelFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: LogLevel) {
        if let Err(e) = self.reload.reload(level.level_filter()) {
            eprintln!("[LOG] Failed to change log level to {}: {}", level, e);
        }
    }
}

/// install the global subscriber
///
/// console output is always on; when `directory` is given, a plain-text copy
/// is appended to `<directory>/ip_tracker.log`.
pub fn init(level: LogLevel, directory: Option<&Path>, console_ansi: bool) -> Result<LogHandle> {
    let (filter, reload) = reload::Layer::new(level.level_filter());

    let file_layer = match directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(LOG_FILE_NAME);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(console_ansi).with_target(false))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LogHandle { reload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for level in LogLevel::ALL {
            assert_eq!(level.as_str().parse::<LogLevel>(), Ok(level));
        }
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert_eq!(
            "VERBOSE".parse::<LogLevel>(),
            Err(ControlError::InvalidLevel("VERBOSE".into()))
        );
        // the platform sends upper case; lower case is not a wire name
        assert!("info".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_relaxed_parse() {
        assert_eq!(LogLevel::parse_relaxed(" debug "), Ok(LogLevel::Debug));
        assert!(LogLevel::parse_relaxed("loud").is_err());
    }

    #[test]
    fn test_level_filters() {
        assert_eq!(LogLevel::Off.level_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Warn.level_filter(), LevelFilter::WARN);
    }
}
