//! ==============================================================================
//! lib.rs - edge gateway library
//! ==============================================================================
//!
//! the binary (main.rs) only wires these modules together.
//!
//!     reading / record / store   durable reading log
//!     registry                   in-memory attributes and parameters
//!     sampler / scheduler        what to observe and when to report it
//!     control                    remote log-level commands
//!     session                    platform transport seam
//!     config / logging / error   ambient setup
//!
//! ==============================================================================

pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod reading;
pub mod record;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod session;
pub mod store;
