use serde::{Deserialize, Serialize};
use std::fmt;

/// one telemetry observation under a reference key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// platform reference (e.g. "cpuT", "log", "e4")
    pub reference: String,

    /// text or numeric payload
    pub value: ReadingValue,

    /// reading timestamp in milliseconds, best-effort
    #[serde(default)]
    pub timestamp_ms: u64,
}

/// reading payload
/// json numbers map to Number, json strings to Text
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
}

impl Reading {
    /// new reading stamped with the current time
    pub fn new(reference: impl Into<String>, value: impl Into<ReadingValue>) -> Self {
        Self {
            reference: reference.into(),
            value: value.into(),
            timestamp_ms: timestamp_ms(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Number(n) => write!(f, "{}", n),
            ReadingValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ReadingValue {
    fn from(v: f64) -> Self {
        ReadingValue::Number(v)
    }
}

impl From<String> for ReadingValue {
    fn from(v: String) -> Self {
        ReadingValue::Text(v)
    }
}

impl From<&str> for ReadingValue {
    fn from(v: &str) -> Self {
        ReadingValue::Text(v.to_string())
    }
}

/// get current timestamp in milliseconds (unix epoch)
///
/// a clock set before 1970 yields 0 instead of panicking.
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
