//! Input validation and parsing for rules and profiles
//!
//! Everything that reaches the profile store passes through here first, so
//! malformed rules are rejected at creation time and never enter a rule set.

use crate::core::firewall::{Action, Direction, PortEntry, Protocol, Rule};
use std::str::FromStr;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a rule name.
///
/// Constraints:
/// - 1 to 64 characters
/// - ASCII alphanumeric plus `_ - . :` only, so names are safe as file keys
///   and in CLI output
pub fn validate_rule_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }
    if name.len() > 64 {
        return Err("Name too long (max 64 chars)".into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -, ., :)".into());
    }
    Ok(())
}

/// Validates a profile name for filesystem safety.
///
/// Constraints:
/// - Alphanumeric, underscores, and hyphens only: Prevents shell injection and
///   cross-platform filename issues.
/// - Max 64 chars: Ensures filenames stay within system limits (typically 255)
///   while allowing descriptive names.
/// - Rejects "." and "..": Critical path traversal protection.
pub fn validate_profile_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }

    if name.len() > 64 {
        return Err("Name too long (max 64 chars)".into());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Name contains invalid characters (use only a-z, 0-9, _, -)".into());
    }

    // Prevent path traversal
    if name == "." || name == ".." {
        return Err("Invalid name".into());
    }

    Ok(())
}

/// Validates an application matcher (exact path, `*`, or glob pattern).
pub fn validate_application(pattern: &str) -> Result<(), String> {
    if pattern.trim().is_empty() {
        return Err("Application is required (use * to match any)".into());
    }
    if pattern.len() > 4096 {
        return Err("Application path too long (max 4096 bytes)".into());
    }
    if pattern.chars().any(char::is_control) {
        return Err("Application contains control characters".into());
    }
    Ok(())
}

/// Validates a profile description.
pub fn validate_description(description: &str) -> Result<(), String> {
    if description.len() > 256 {
        return Err("Description too long (max 256 characters)".into());
    }
    if description.chars().any(char::is_control) {
        return Err("Description contains control characters".into());
    }
    Ok(())
}

/// Parses a comma-separated port list (`"22,80,8000-9000"`).
///
/// An empty string yields an empty set, which matches any port.
pub fn parse_ports(input: &str) -> Result<Vec<PortEntry>, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(PortEntry::from_str)
        .collect()
}

/// Parses a direction matcher token; `any` (or empty) matches both directions.
pub fn parse_direction_matcher(token: &str) -> Result<Option<Direction>, String> {
    let token = token.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("any") {
        return Ok(None);
    }
    Direction::from_str(token)
        .map(Some)
        .map_err(|_| format!("unknown direction: {token}"))
}

/// Parses an enum token (protocol, action, direction), naming the field in the error.
pub fn parse_token<T: FromStr>(field: &str, token: &str) -> Result<T, String> {
    T::from_str(token.trim()).map_err(|_| format!("unknown {field}: {}", token.trim()))
}

/// Builds a validated rule from management-surface tokens.
///
/// `ports` is a comma-separated list (empty for any) and `direction` accepts
/// `inbound`, `outbound` or `any`.
pub fn rule_from_tokens(
    name: &str,
    application: &str,
    action: &str,
    protocol: &str,
    ports: &str,
    direction: &str,
) -> crate::Result<Rule> {
    let action: Action =
        parse_token("action", action).map_err(|m| crate::Error::validation("action", m))?;
    let protocol: Protocol =
        parse_token("protocol", protocol).map_err(|m| crate::Error::validation("protocol", m))?;
    let ports = parse_ports(ports).map_err(|m| crate::Error::validation("ports", m))?;
    let direction =
        parse_direction_matcher(direction).map_err(|m| crate::Error::validation("direction", m))?;

    let mut rule = Rule::new(name, application, action)
        .with_protocol(protocol)
        .with_ports(ports);
    rule.direction = direction;
    rule.validate()?;
    Ok(rule)
}
