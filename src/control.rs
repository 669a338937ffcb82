//! ==============================================================================
//! control.rs - remote log-level control bridge
//! ==============================================================================
//!
//! purpose:
//!     the platform can push a "log" reading to change the gateway's log level.
//!     this module is the meeting point between the task that receives those
//!     commands and the main task that answers them.
//!
//! behaviour:
//!     - valid level   -> applied and remembered, nothing is sent back
//!     - invalid level -> level untouched, state marked invalid, main task
//!                        woken to re-publish the last good level
//!
//!     the invalid flag is a single slot: several bad commands arriving before
//!     the main task runs produce one correction.
//!
//! relationships:
//!     - used by: main.rs (correction loop), session.rs (feed endpoint)
//!     - uses: session.rs (re-publishes corrections through TelemetrySession)
//!     - implements: session::FeedUpdateHandler
//!     - uses: logging.rs (LogLevel)
//!
//! ==============================================================================

use crate::error::ControlError;
use crate::logging::LogLevel;
use crate::reading::{Reading, ReadingValue};
use crate::session::{FeedUpdateHandler, TelemetrySession};

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// reference the platform uses for log-level commands
pub const LOG_REFERENCE: &str = "log";

struct ControlState {
    current_level: LogLevel,
    is_valid: bool,
}

pub struct ControlBridge {
    state: Mutex<ControlState>,
    wake: Notify,
    apply: Box<dyn Fn(LogLevel) + Send + Sync>,
}

impl ControlBridge {
    /// `apply` is called (under the state lock) for every accepted level
    pub fn new<F>(initial: LogLevel, apply: F) -> Self
    where
        F: Fn(LogLevel) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(ControlState { current_level: initial, is_valid: true }),
            wake: Notify::new(),
            apply: Box::new(apply),
        }
    }

    pub fn current_level(&self) -> LogLevel {
        self.lock().current_level
    }

    pub fn is_valid(&self) -> bool {
        self.lock().is_valid
    }

    /// apply a requested level, or flag it for correction
    pub fn submit_level(&self, requested: &str) -> Result<LogLevel, ControlError> {
        let mut state = self.lock();
        match requested.parse::<LogLevel>() {
            Ok(level) => {
                (self.apply)(level);
                tracing::info!("Log has been updated from {} to {}", state.current_level, level);
                state.current_level = level;
                Ok(level)
            }
            Err(e) => {
                tracing::info!(
                    "Unknown log value {} reverting to {}",
                    requested,
                    state.current_level
                );
                state.is_valid = false;
                self.wake.notify_one();
                Err(e)
            }
        }
    }

    /// wait until a rejected level needs correcting, then take the correction
    ///
    /// returns the last good level and marks the state valid again in the
    /// same critical section. wakeups are re-checked against the flag.
    pub async fn next_correction(&self) -> LogLevel {
        loop {
            {
                let mut state = self.lock();
                if !state.is_valid {
                    state.is_valid = true;
                    return state.current_level;
                }
            }
            self.wake.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// wait for the next rejected level and answer it by re-publishing the level
/// in force. returns the level that was sent back.
pub async fn correct_once(bridge: &ControlBridge, session: &dyn TelemetrySession) -> LogLevel {
    let level = bridge.next_correction().await;
    if session.add_reading(Reading::new(LOG_REFERENCE, level.as_str())).await {
        if let Err(e) = session.publish().await {
            tracing::warn!("Couldn't publish log level correction: {}", e);
        }
    }
    level
}

impl FeedUpdateHandler for ControlBridge {
    fn handle_update(&self, device_key: &str, readings: &BTreeMap<u64, Vec<Reading>>) {
        for (timestamp, batch) in readings {
            tracing::debug!("Received feed information for time: {}", timestamp);

            for reading in batch {
                tracing::debug!(
                    "Received feed information for reference '{}' on device {}",
                    reading.reference,
                    device_key
                );
                if reading.reference != LOG_REFERENCE {
                    continue;
                }
                let requested = match &reading.value {
                    ReadingValue::Text(s) => s.clone(),
                    other => other.to_string(),
                };
                // the outcome is already logged and, if invalid, queued for correction
                let _ = self.submit_level(&requested);
            }
        }
    }
}
