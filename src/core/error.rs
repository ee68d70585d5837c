use std::time::Duration;
use thiserror::Error;

/// Core error types for appwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input validation failed (malformed rule, profile, or token)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Referenced profile does not exist
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Referenced rule does not exist in the rule library
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Referenced rule is not part of the named profile
    #[error("Rule '{rule}' is not part of profile '{profile}'")]
    RuleNotInProfile { profile: String, rule: String },

    /// A profile with this name already exists
    #[error("Profile already exists: {0}")]
    DuplicateProfile(String),

    /// The profile already references a rule with this name
    #[error("Profile '{profile}' already contains a rule named '{rule}'")]
    DuplicateRule { profile: String, rule: String },

    /// The operation is not allowed on the active profile
    #[error("Profile '{0}' is active and cannot be deleted")]
    ActiveProfile(String),

    /// Storage collaborator failed after all retries
    #[error("Storage error during {operation} after {attempts} attempt(s): {source}")]
    Storage {
        operation: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    /// The decision pipeline no longer accepts connection events
    #[error("Decision pipeline is closed")]
    PipelineClosed,

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors caused by naming something that does not
    /// exist or cannot be touched in its current state.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Self::ProfileNotFound(_)
                | Self::RuleNotFound(_)
                | Self::RuleNotInProfile { .. }
                | Self::ActiveProfile(_)
        )
    }

    /// Returns a user-facing translation of this error with hints.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Self::Validation { field, message } => {
                ErrorTranslation::new(format!("Invalid {field}: {message}"))
                    .with_suggestion("Protocols: tcp, udp, icmp, any")
                    .with_suggestion("Directions: inbound, outbound, any")
                    .with_suggestion("Actions: allow, block")
                    .with_suggestion("Ports: 1-65535, single (443) or range (8000-9000)")
            }
            Self::ProfileNotFound(name) => {
                ErrorTranslation::new(format!("No profile named '{name}'"))
                    .with_suggestion("List profiles with: appwall profiles list")
            }
            Self::RuleNotFound(name) | Self::RuleNotInProfile { rule: name, .. } => {
                ErrorTranslation::new(format!("No rule named '{name}'"))
                    .with_suggestion("List rules with: appwall rules list")
            }
            Self::ActiveProfile(name) => {
                ErrorTranslation::new(format!("'{name}' is the active profile"))
                    .with_suggestion("Activate another profile before deleting this one")
            }
            Self::Storage { source, .. } if source.is_transient() => {
                ErrorTranslation::new(self.to_string())
                    .with_suggestion("The store may be busy or slow; try again")
                    .with_suggestion("Check free disk space in the data directory")
            }
            Self::Storage { .. } | Self::Io(_) => ErrorTranslation::new(self.to_string())
                .with_suggestion("Check permissions on the data directory")
                .with_suggestion("Inspect the operational log for details"),
            _ => ErrorTranslation::new(self.to_string()),
        }
    }
}

/// Errors raised by storage collaborators (profile store and event log backends)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Stored data corrupted: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Transient errors are worth retrying; the rest fail immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::InvalidInput
            ),
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Serialization(_) | Self::Corrupted(_) => false,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;
