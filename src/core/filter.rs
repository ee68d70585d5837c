//! Query descriptor shared by decision-log and stats queries
//!
//! Unset fields act as wildcards. Time bounds are inclusive. Applications
//! compare ignoring ASCII case, like rule application patterns do.

use crate::core::firewall::{Action, ConnectionEventLog, Direction, Protocol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub application: Option<String>,
    pub protocol: Option<Protocol>,
    pub direction: Option<Direction>,
    pub action: Option<Action>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl Filter {
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Matches the non-temporal fields.
    pub fn matches_fields(
        &self,
        application: &str,
        protocol: Protocol,
        direction: Direction,
        action: Action,
    ) -> bool {
        self.application
            .as_deref()
            .is_none_or(|a| a.eq_ignore_ascii_case(application))
            && self.protocol.is_none_or(|p| p == protocol)
            && self.direction.is_none_or(|d| d == direction)
            && self.action.is_none_or(|a| a == action)
    }

    /// Returns `true` if `at` lies within `[since, until]`.
    pub fn contains_time(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|s| at >= s) && self.until.is_none_or(|u| at <= u)
    }

    /// Returns `true` if the half-open span `[start, end)` overlaps `[since, until]`.
    pub fn intersects_span(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.since.is_none_or(|s| end > s) && self.until.is_none_or(|u| start <= u)
    }

    pub fn matches_entry(&self, entry: &ConnectionEventLog) -> bool {
        self.matches_fields(
            &entry.event.app_path,
            entry.event.protocol,
            entry.event.direction,
            entry.decision,
        ) && self.contains_time(entry.timestamp)
    }
}
