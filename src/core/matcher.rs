//! Rule matching
//!
//! [`evaluate`] maps a connection attempt and an ordered rule list to a
//! verdict. It is a pure function: no locks, no I/O, no allocation beyond
//! the returned rule name, so any number of decision tasks may call it
//! concurrently against a shared [`RuleSet`] snapshot.
//!
//! # Matching
//!
//! Rules are tried in profile order and the first match wins. A rule matches
//! when all of the following hold:
//!
//! - the application matcher accepts the event's application path
//!   (`*` = any, `*`/`?` glob, otherwise exact; ASCII case-insensitive)
//! - the protocol matcher is `any` or equals the event protocol
//! - the direction matcher is unset or equals the event direction
//! - the port set is empty or contains [`ConnectionEvent::relevant_port`]
//!
//! When nothing matches, the default policy applies with an empty rule name.
//!
//! Rules are compiled once when a snapshot is built. A port set that fails
//! validation at that point (only possible for rules that bypassed
//! [`Rule::validate`], e.g. hand-edited files) compiles to "any port".

use crate::core::firewall::{Action, ConnectionEvent, PortEntry, Protocol, Rule};

/// Compiled application matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMatcher {
    Any,
    Exact(String),
    Glob(Vec<char>),
}

impl AppMatcher {
    pub fn compile(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            AppMatcher::Any
        } else if pattern.contains(['*', '?']) {
            AppMatcher::Glob(pattern.chars().map(|c| c.to_ascii_lowercase()).collect())
        } else {
            AppMatcher::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, app_path: &str) -> bool {
        match self {
            AppMatcher::Any => true,
            AppMatcher::Exact(path) => path.eq_ignore_ascii_case(app_path),
            AppMatcher::Glob(pattern) => {
                let text: Vec<char> = app_path.chars().map(|c| c.to_ascii_lowercase()).collect();
                glob_match(pattern, &text)
            }
        }
    }
}

/// Wildcard match with single-star backtracking.
///
/// `*` matches any run of characters (including `/`), `?` exactly one.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// A rule with its matchers precompiled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    rule: Rule,
    app: AppMatcher,
    /// Empty means any port
    ports: Vec<PortEntry>,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> Self {
        let app = AppMatcher::compile(&rule.application);
        let ports = if rule.ports.iter().all(|p| p.validate().is_ok()) {
            rule.ports.clone()
        } else {
            tracing::warn!(
                "Rule '{}' has a malformed port set ({}); matching any port",
                rule.name,
                rule.port_display()
            );
            Vec::new()
        };
        Self { rule, app, ports }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn matches(&self, event: &ConnectionEvent) -> bool {
        self.rule.protocol.accepts(event.protocol)
            && self.rule.direction.is_none_or(|d| d == event.direction)
            && self.port_matches(event.relevant_port())
            && self.app.matches(&event.app_path)
    }

    fn port_matches(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.iter().any(|p| p.contains(port))
    }
}

/// Immutable, ordered rule list of one profile at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    profile: Option<String>,
    version: u64,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Snapshot used before any profile has been activated.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn compile(
        profile: impl Into<String>,
        version: u64,
        rules: impl IntoIterator<Item = Rule>,
    ) -> Self {
        Self {
            profile: Some(profile.into()),
            version,
            rules: rules.into_iter().map(CompiledRule::compile).collect(),
        }
    }

    /// Name of the profile this snapshot was built from.
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Monotonic store version at the time the snapshot was published.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn compiled(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(CompiledRule::rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, event: &ConnectionEvent, default_policy: Action) -> Verdict {
        evaluate(event, &self.rules, default_policy)
    }
}

/// Outcome of rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    /// Empty when the default policy applied
    pub rule_name: String,
}

impl Verdict {
    pub fn default_policy(action: Action) -> Self {
        Self {
            action,
            rule_name: String::new(),
        }
    }
}

/// First-match-wins evaluation of `event` against `rules`.
pub fn evaluate(event: &ConnectionEvent, rules: &[CompiledRule], default_policy: Action) -> Verdict {
    rules
        .iter()
        .find(|r| r.matches(event))
        .map_or_else(
            || Verdict::default_policy(default_policy),
            |r| Verdict {
                action: r.rule.action,
                rule_name: r.rule.name.clone(),
            },
        )
}

/// Builds the name used for rules learned from a one-off decision.
///
/// `/usr/bin/firefox-esr` over tcp to 443 becomes `auto_firefox_esr_tcp_443`.
pub fn learned_rule_name(app_path: &str, protocol: Protocol, port: u16) -> String {
    let file = app_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(app_path);
    let file = file
        .strip_suffix(".exe")
        .or_else(|| file.strip_suffix(".EXE"))
        .unwrap_or(file);
    let stem: String = file
        .chars()
        .filter(|c| !matches!(c, '(' | ')'))
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(40)
        .collect();
    format!("auto_{stem}_{}_{port}", protocol.as_str())
}

/// Builds a rule that reproduces `action` for connections like `event`.
pub fn learned_rule(event: &ConnectionEvent, action: Action) -> Rule {
    let port = event.relevant_port();
    let mut rule = Rule::new(
        learned_rule_name(&event.app_path, event.protocol, port),
        event.app_path.clone(),
        action,
    )
    .with_protocol(event.protocol)
    .with_direction(event.direction);
    if port != 0 {
        rule.ports = vec![PortEntry::Single(port)];
    }
    rule
}
