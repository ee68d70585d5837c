//! Connection decision engine
//!
//! - [`firewall`]: rules, profiles, connection events and log records
//! - [`matcher`]: compiled rules and first-match-wins evaluation
//! - [`profiles`]: rule library, profiles and the active rule-set snapshot
//! - [`event_log`]: append-only, queryable decision log
//! - [`stats`]: per-application traffic buckets rebuilt from the log
//! - [`pipeline`]: turns connection attempts into logged, published verdicts
//! - [`engine`]: wires the above together from an `EngineConfig`
//! - [`storage`] / [`persist`]: storage interfaces and their file backends
//! - [`error`]: error types

pub mod engine;
pub mod error;
pub mod event_log;
pub mod filter;
pub mod firewall;
pub mod matcher;
pub mod persist;
pub mod pipeline;
pub mod profiles;
pub mod retry;
pub mod stats;
pub mod storage;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
