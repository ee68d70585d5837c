//! appwall - application firewall decision engine
//!
//! Classifies connection attempts made by local applications against
//! user-defined rules grouped into profiles, and records every allow/block
//! decision.
//!
//! # Architecture
//!
//! - [`core`] - Rule matching, profile store, decision pipeline, event log, stats
//! - [`oplog`] - Operational event log (storage failures, rule and profile changes)
//! - [`validators`] - Input validation and token parsing
//! - [`config`] - Engine configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Guarantees
//!
//! - Decisions always see one complete rule-set snapshot, never a mix
//! - At most one profile is active at a time
//! - The decision log is totally ordered by timestamp and id
//! - Stats can be rebuilt from the decision log alone
//! - A storage failure never drops a decision

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod config;
pub mod core;
pub mod oplog;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{Action, ConnectionEvent, Direction, Protocol, Rule};
