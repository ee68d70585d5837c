//! Firewall data model
//!
//! This module defines the value types that flow through the decision engine:
//!
//! - [`Rule`]: a single match-and-act policy statement
//! - [`Profile`]: a named, ordered collection of rule *names*
//! - [`ConnectionEvent`]: one connection attempt observed by the capture layer
//! - [`ConnectionEventLog`]: the logged verdict for a connection attempt
//! - [`TrafficUpdate`]: a later byte-count report for a logged decision
//!
//! Rules are immutable value objects. Changing a rule means replacing it in
//! the profile store under the same name.
//!
//! # Example
//!
//! ```
//! use appwall::core::firewall::{Action, Direction, PortEntry, Protocol, Rule};
//!
//! let rule = Rule::new("block-telnet", "*", Action::Block)
//!     .with_protocol(Protocol::Tcp)
//!     .with_ports(vec![PortEntry::Single(23)])
//!     .with_direction(Direction::Outbound);
//! assert!(rule.validate().is_ok());
//! ```

use crate::core::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Maximum number of rules a single profile may reference
///
/// Limit prevents memory exhaustion from malformed/malicious imports.
pub const MAX_RULES: usize = 1000;

/// Transport protocol of a connection attempt, or a rule's protocol matcher
///
/// `Any` only makes sense on the rule side.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    /// Match all protocols
    #[default]
    #[strum(serialize = "any")]
    Any,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// Internet Control Message Protocol
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// Returns `true` if a rule with this protocol matcher accepts `observed`.
    pub fn accepts(self, observed: Protocol) -> bool {
        self == Protocol::Any || self == observed
    }
}

/// Direction of a connection attempt relative to this host
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    /// Remote peer connecting to a local application
    #[strum(serialize = "inbound")]
    Inbound,
    /// Local application connecting out
    #[strum(serialize = "outbound")]
    Outbound,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Verdict for a connection attempt
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Action {
    /// Let the connection through
    #[strum(serialize = "allow")]
    Allow,
    /// Refuse the connection
    #[default]
    #[serde(alias = "deny")]
    #[strum(to_string = "block", serialize = "deny")]
    Block,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Block => "block",
        }
    }
}

/// A single port or an inclusive port range inside a rule's port set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PortEntry {
    Single(u16),
    Range { start: u16, end: u16 },
}

impl PortEntry {
    pub fn range(start: u16, end: u16) -> Self {
        if start == end {
            PortEntry::Single(start)
        } else {
            PortEntry::Range { start, end }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortEntry::Single(p) => p == port,
            PortEntry::Range { start, end } => (start..=end).contains(&port),
        }
    }

    /// Checks the entry against port bounds (1-65535, start <= end).
    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            PortEntry::Single(p) => crate::validators::validate_port(p).map(|_| ()),
            PortEntry::Range { start, end } => {
                crate::validators::validate_port_range(start, end).map(|_| ())
            }
        }
    }
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortEntry::Single(p) => write!(f, "{p}"),
            PortEntry::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl FromStr for PortEntry {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {p}"))
        };
        let entry = match s.split_once('-') {
            Some((start, end)) => PortEntry::range(parse(start)?, parse(end)?),
            None => PortEntry::Single(parse(s)?),
        };
        entry.validate()?;
        Ok(entry)
    }
}

/// A single match-and-act policy statement
///
/// Matching semantics live in [`crate::core::matcher`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    /// Unique name within a profile; also the key in the rule library
    pub name: String,
    /// Application path, `*`, or a glob pattern (`/usr/bin/*`)
    pub application: String,
    pub action: Action,
    #[serde(default)]
    pub protocol: Protocol,
    /// Empty means any port
    #[serde(default)]
    pub ports: Vec<PortEntry>,
    /// `None` matches both directions
    #[serde(default)]
    pub direction: Option<Direction>,
}

impl Rule {
    pub fn new(name: impl Into<String>, application: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            application: application.into(),
            action,
            protocol: Protocol::Any,
            ports: Vec::new(),
            direction: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_ports(mut self, ports: Vec<PortEntry>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Rejects rules that must never enter a rule set.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_rule_name(&self.name)
            .map_err(|m| crate::Error::validation("name", m))?;
        crate::validators::validate_application(&self.application)
            .map_err(|m| crate::Error::validation("application", m))?;
        for entry in &self.ports {
            entry
                .validate()
                .map_err(|m| crate::Error::validation("ports", format!("{entry}: {m}")))?;
        }
        Ok(())
    }

    /// Port set rendered for listings (`"any"` when empty).
    pub fn port_display(&self) -> String {
        if self.ports.is_empty() {
            "any".to_string()
        } else {
            self.ports
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        }
    }
}

/// A named collection of rule references
///
/// Profiles never embed rules; the profile store resolves names against its
/// rule library when building the active snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Derived from the store's active pointer when listed; ignored on import
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            active: false,
            rules: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_profile_name(&self.name)
            .map_err(|m| crate::Error::validation("profile name", m))?;
        crate::validators::validate_description(&self.description)
            .map_err(|m| crate::Error::validation("description", m))?;
        if self.rules.len() > MAX_RULES {
            return Err(crate::Error::validation(
                "rules",
                format!("{} rules (max: {MAX_RULES})", self.rules.len()),
            ));
        }
        Ok(())
    }

    pub fn references(&self, rule: &str) -> bool {
        self.rules.iter().any(|r| r == rule)
    }
}

/// One connection attempt as delivered by the capture layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub app_path: String,
    #[serde(default)]
    pub pid: Option<u32>,
    pub protocol: Protocol,
    pub direction: Direction,
    #[serde(default = "unspecified_addr")]
    pub src_addr: IpAddr,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default = "unspecified_addr")]
    pub dst_addr: IpAddr,
    #[serde(default)]
    pub dst_port: u16,
}

fn unspecified_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl ConnectionEvent {
    pub fn new(app_path: impl Into<String>, protocol: Protocol, direction: Direction) -> Self {
        Self {
            app_path: app_path.into(),
            pid: None,
            protocol,
            direction,
            src_addr: unspecified_addr(),
            src_port: 0,
            dst_addr: unspecified_addr(),
            dst_port: 0,
        }
    }

    pub fn with_source(mut self, addr: IpAddr, port: u16) -> Self {
        self.src_addr = addr;
        self.src_port = port;
        self
    }

    pub fn with_destination(mut self, addr: IpAddr, port: u16) -> Self {
        self.dst_addr = addr;
        self.dst_port = port;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Port a rule's port set is compared against.
    ///
    /// Outbound attempts match on the destination port, inbound attempts on
    /// the source port as reported by the capture layer.
    pub fn relevant_port(&self) -> u16 {
        match self.direction {
            Direction::Outbound => self.dst_port,
            Direction::Inbound => self.src_port,
        }
    }
}

/// The logged verdict for one connection attempt
///
/// `id` and `timestamp` are finalized by the event log at append time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionEventLog {
    pub id: u64,
    pub event: ConnectionEvent,
    pub decision: Action,
    pub timestamp: DateTime<Utc>,
    /// Empty when the default policy applied
    pub rule_name: String,
}

impl ConnectionEventLog {
    pub fn new(event: ConnectionEvent, decision: Action, rule_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            event,
            decision,
            timestamp: Utc::now(),
            rule_name: rule_name.into(),
        }
    }

    pub fn used_default_policy(&self) -> bool {
        self.rule_name.is_empty()
    }
}

/// Bytes transferred on a connection after its decision was logged
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficUpdate {
    pub id: u64,
    /// Id of the decision this traffic belongs to
    pub entry_id: u64,
    pub application: String,
    pub protocol: Protocol,
    pub direction: Direction,
    pub action: Action,
    /// Decision timestamp; selects the stats bucket
    pub decided_at: DateTime<Utc>,
    pub reported_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

impl TrafficUpdate {
    pub fn for_entry(entry: &ConnectionEventLog, bytes_sent: u64, bytes_recv: u64) -> Self {
        Self {
            id: 0,
            entry_id: entry.id,
            application: entry.event.app_path.clone(),
            protocol: entry.event.protocol,
            direction: entry.event.direction,
            action: entry.decision,
            decided_at: entry.timestamp,
            reported_at: Utc::now(),
            bytes_sent,
            bytes_recv,
        }
    }
}

/// Anything the event log stores
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Decision(ConnectionEventLog),
    Traffic(TrafficUpdate),
}

impl LogRecord {
    pub fn id(&self) -> u64 {
        match self {
            LogRecord::Decision(d) => d.id,
            LogRecord::Traffic(t) => t.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Decision(d) => d.timestamp,
            LogRecord::Traffic(t) => t.reported_at,
        }
    }

    pub fn as_decision(&self) -> Option<&ConnectionEventLog> {
        match self {
            LogRecord::Decision(d) => Some(d),
            LogRecord::Traffic(_) => None,
        }
    }

    /// Stamps the append-time sequence number and timestamp.
    pub(crate) fn stamp(&mut self, id: u64, timestamp: DateTime<Utc>) {
        match self {
            LogRecord::Decision(d) => {
                d.id = id;
                d.timestamp = timestamp;
            }
            LogRecord::Traffic(t) => {
                t.id = id;
                t.reported_at = timestamp;
            }
        }
    }
}
