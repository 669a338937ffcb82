//! ==============================================================================
//! store.rs - durable, append-only, key-grouped reading store
//! ==============================================================================
//!
//! purpose:
//!     the outbound buffer of the telemetry session. every reading the gateway
//!     decides to send is appended here first and stays until the platform
//!     has accepted it.
//!
//! layout:
//!     one record per line (see record.rs), in append order. groups are never
//!     stored; they are rebuilt by scanning the whole file and grouping lines
//!     by key, keeping append order within each group.
//!
//! failure model:
//!     - open/write failures come back as StoreError, the caller logs them and
//!       moves on (that one reading is lost, the process is not)
//!     - lines that don't decode are skipped
//!     - removal rewrites the file through a temp sibling + rename
//!
//! relationships:
//!     - used by: session.rs (HttpSession outbound buffer), main.rs
//!     - uses: record.rs (line codec)
//!
//! ==============================================================================

use crate::error::StoreError;
use crate::reading::Reading;
use crate::record;

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_STORE_PATH: &str = "./log_files/persistence_file";

/// what `remove_readings(key, count)` takes out of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    /// drop the whole group, `count` is ignored
    #[default]
    WholeGroup,
    /// drop only the `count` oldest readings of the group
    OldestFirst,
}

pub struct ReadingStore {
    path: PathBuf,
    removal: RemovalMode,
    // serialises appends and rewrites, the file is the shared resource
    write_lock: Mutex<()>,
}

impl ReadingStore {
    /// open an existing store (or a not-yet-created one) without touching its contents
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with(path, RemovalMode::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, removal: RemovalMode) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create directory for", &path, e))?;
        }
        Ok(Self { path, removal, write_lock: Mutex::new(()) })
    }

    /// open and truncate, giving a fresh empty store
    pub fn create<P: AsRef<Path>>(path: P, removal: RemovalMode) -> Result<Self, StoreError> {
        let store = Self::open_with(path, removal)?;
        store.clear()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn removal_mode(&self) -> RemovalMode {
        self.removal
    }

    /// append one reading under `key`
    pub fn put(&self, key: &str, reading: &Reading) -> Result<(), StoreError> {
        let line = record::encode(key, reading);
        let _guard = self.lock();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io("open", &self.path, e))?;
        writeln!(file, "{}", line)
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::io("write to", &self.path, e))?;
        Ok(())
    }

    /// the most recent `count` readings for `key`, oldest first
    pub fn get_readings(&self, key: &str, count: usize) -> Vec<Reading> {
        let mut groups = self.groups();
        let Some(group) = groups.remove(key) else {
            return Vec::new();
        };
        let skip = group.len().saturating_sub(count);
        group.into_iter().skip(skip).collect()
    }

    /// every key with at least one reading
    pub fn get_readings_keys(&self) -> BTreeSet<String> {
        self.groups()
            .into_iter()
            .filter(|(_, group)| !group.is_empty())
            .map(|(key, _)| key)
            .collect()
    }

    /// remove readings of `key` according to the store's RemovalMode
    pub fn remove_readings(&self, key: &str, count: usize) -> Result<(), StoreError> {
        let _guard = self.lock();
        let lines = self.read_lines()?;

        let group_len = lines
            .iter()
            .filter_map(|line| record::decode(line))
            .filter(|(k, _)| k == key)
            .count();
        let to_remove = match self.removal {
            RemovalMode::WholeGroup => group_len,
            RemovalMode::OldestFirst => count.min(group_len),
        };
        if to_remove == 0 {
            return Ok(());
        }

        let mut kept = String::new();
        let mut removed = 0;
        for line in &lines {
            let Some((k, _)) = record::decode(line) else {
                continue;
            };
            if k == key && removed < to_remove {
                removed += 1;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }

        self.rewrite(&kept)?;
        tracing::debug!(key, removed, "removed readings from store");
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.groups().is_empty()
    }

    /// number of decodable readings across all groups
    pub fn len(&self) -> usize {
        self.groups().values().map(Vec::len).sum()
    }

    /// truncate the backing file
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock();
        fs::File::create(&self.path).map_err(|e| StoreError::io("truncate", &self.path, e))?;
        Ok(())
    }

    /// full scan, grouped by key, append order kept inside each group
    fn groups(&self) -> BTreeMap<String, Vec<Reading>> {
        let lines = match self.read_lines() {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("{}", e);
                return BTreeMap::new();
            }
        };

        let mut groups: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
        let mut skipped = 0usize;
        for line in &lines {
            match record::decode(line) {
                Some((key, reading)) => groups.entry(key).or_default().push(reading),
                None if line.trim().is_empty() => {}
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::trace!(skipped, "skipped malformed store lines");
        }
        groups
    }

    /// text lines of the file; a file that doesn't exist yet reads as empty.
    /// lines that aren't valid utf-8 (a torn write) are dropped here.
    fn read_lines(&self) -> Result<Vec<String>, StoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("read from", &self.path, e)),
        };

        let mut lines = Vec::new();
        let mut garbled = 0usize;
        for raw in BufReader::new(file).split(b'\n') {
            let mut raw = raw.map_err(|e| StoreError::io("read from", &self.path, e))?;
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            match String::from_utf8(raw) {
                Ok(line) => lines.push(line),
                Err(_) => garbled += 1,
            }
        }
        if garbled > 0 {
            tracing::warn!(garbled, "skipped store lines that aren't valid UTF-8");
        }
        Ok(lines)
    }

    fn rewrite(&self, contents: &str) -> Result<(), StoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, contents).map_err(|e| StoreError::io("write to", &tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io("replace", &self.path, e))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // the guarded value is (), a poisoned lock carries no broken state
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}
