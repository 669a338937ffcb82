//! ==============================================================================
//! record.rs - line codec for the reading store
//! ==============================================================================
//!
//! purpose:
//!     turns one (key, reading) pair into one line of the persistence file and
//!     back again.
//!
//! format:
//!     v1 (written):  {"v":1,"key":"e4","value":"192.168.1.10","ts":1718000000000}
//!     legacy (read): Reference: e4      Reading: 192.168.1.10
//!
//!     v1 fields are json strings, so keys and values may contain spaces,
//!     newlines or the legacy markers. legacy lines are only ever decoded so
//!     that files written by the older tracker still load.
//!
//! relationships:
//!     - used by: store.rs
//!
//! ==============================================================================

use crate::reading::{Reading, ReadingValue};
use serde::Deserialize;
use serde_json::{Map, Number, Value};

pub const RECORD_VERSION: u64 = 1;

const LEGACY_KEY_MARKER: &str = "Reference: ";
const LEGACY_VALUE_MARKER: &str = "Reading: ";

#[derive(Deserialize)]
struct StoredRecord {
    v: u64,
    key: String,
    value: ReadingValue,
    #[serde(default)]
    ts: u64,
}

/// encode a reading as a single v1 line (no trailing newline)
pub fn encode(key: &str, reading: &Reading) -> String {
    let value = match &reading.value {
        ReadingValue::Text(s) => Value::String(s.clone()),
        // json has no NaN/inf, keep them as text rather than writing null
        ReadingValue::Number(n) => Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(n.to_string())),
    };

    let mut record = Map::new();
    record.insert("v".into(), Value::from(RECORD_VERSION));
    record.insert("key".into(), Value::String(key.to_string()));
    record.insert("value".into(), value);
    record.insert("ts".into(), Value::from(reading.timestamp_ms));
    Value::Object(record).to_string()
}

/// decode one line; None for blank or malformed lines
pub fn decode(line: &str) -> Option<(String, Reading)> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    if line.starts_with('{') {
        decode_v1(line)
    } else {
        decode_legacy(line)
    }
}

fn decode_v1(line: &str) -> Option<(String, Reading)> {
    let record: StoredRecord = serde_json::from_str(line).ok()?;
    if record.v != RECORD_VERSION || record.key.is_empty() {
        return None;
    }
    let reading = Reading {
        reference: record.key.clone(),
        value: record.value,
        timestamp_ms: record.ts,
    };
    Some((record.key, reading))
}

fn decode_legacy(line: &str) -> Option<(String, Reading)> {
    let key_start = line.find(LEGACY_KEY_MARKER)? + LEGACY_KEY_MARKER.len();
    let rest = &line[key_start..];
    let key_len = rest.find(' ')?;
    let key = &rest[..key_len];
    if key.is_empty() {
        return None;
    }

    let after_key = &rest[key_len..];
    let value_start = after_key.find(LEGACY_VALUE_MARKER)? + LEGACY_VALUE_MARKER.len();
    let value = &after_key[value_start..];

    let reading = Reading {
        reference: key.to_string(),
        value: ReadingValue::Text(value.to_string()),
        timestamp_ms: 0,
    };
    Some((key.to_string(), reading))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_line_is_single_line() {
        let reading = Reading::new("note", "two\nlines").with_timestamp(5);
        let line = encode("note", &reading);
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line), Some(("note".to_string(), reading)));
    }

    #[test]
    fn test_marker_text_in_fields() {
        let key = "Reference: odd key";
        let reading = Reading::new(key, "Reading: 1      Reading: 2").with_timestamp(9);
        let (decoded_key, decoded) = decode(&encode(key, &reading)).unwrap();
        assert_eq!(decoded_key, key);
        assert_eq!(decoded, reading);
    }

    #[test]
    fn test_numbers_stay_numbers() {
        let reading = Reading::new("cpuT", 45.3).with_timestamp(1);
        let (_, decoded) = decode(&encode("cpuT", &reading)).unwrap();
        assert_eq!(decoded.value, ReadingValue::Number(45.3));
    }

    #[test]
    fn test_non_finite_number_written_as_text() {
        let reading = Reading::new("cpuT", f64::NAN);
        let (_, decoded) = decode(&encode("cpuT", &reading)).unwrap();
        assert_eq!(decoded.value, ReadingValue::Text("NaN".into()));
    }

    #[test]
    fn test_legacy_line() {
        let (key, reading) = decode("Reference: w4      Reading: 10.0.0.7").unwrap();
        assert_eq!(key, "w4");
        assert_eq!(reading.value, ReadingValue::Text("10.0.0.7".into()));
        assert_eq!(reading.timestamp_ms, 0);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert!(decode("").is_none());
        assert!(decode("   ").is_none());
        assert!(decode("garbage").is_none());
        assert!(decode("Reference: nospace").is_none());
        assert!(decode("Reference: k      no value marker").is_none());
        assert!(decode("{\"v\":2,\"key\":\"k\",\"value\":1}").is_none());
        assert!(decode("{\"v\":1,\"key\":\"\",\"value\":1}").is_none());
        assert!(decode("{\"v\":1,\"key\":\"k\"").is_none());
    }
}
