//! ==============================================================================
//! registry.rs - in-memory attribute and parameter maps
//! ==============================================================================
//!
//! purpose:
//!     device attributes and connectivity parameters live next to the reading
//!     store but are NOT part of the durable log. they are plain maps owned by
//!     the process and are gone after a restart.
//!
//! relationships:
//!     - used by: main.rs (registers device attributes at startup),
//!                session.rs (reports them on connect)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// a device attribute reported once per session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub data_type: AttributeType,
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeType {
    String,
    Numeric,
    Boolean,
}

impl Attribute {
    pub fn new(
        name: impl Into<String>,
        data_type: AttributeType,
        value: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), data_type, value: value.into() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterName {
    OutboundDataMode,
    FirmwareVersion,
    MaximumMessageSize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: ParameterName,
    pub value: String,
}

/// process-lifetime key/value map
pub struct MemoryMap<V> {
    inner: RwLock<BTreeMap<String, V>>,
}

impl<V> Default for MemoryMap<V> {
    fn default() -> Self {
        Self { inner: RwLock::new(BTreeMap::new()) }
    }
}

impl<V: Clone> MemoryMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert or replace; always succeeds for an in-memory map
    pub fn put(&self, key: impl Into<String>, value: V) -> bool {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).insert(key.into(), value);
        true
    }

    pub fn get_all(&self) -> BTreeMap<String, V> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn remove_all(&self) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn remove(&self, key: &str) {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

pub type AttributeRegistry = MemoryMap<Attribute>;
pub type ParameterRegistry = MemoryMap<Parameter>;
