//! Error type for configuration loading and validation.
//!
//! Every variant names the offending field so an operator can fix the file
//! without reading source code.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a node configuration.
///
/// Configuration errors are always fatal: no partially valid configuration
/// is ever returned alongside one.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML, has a wrongly typed value, or
    /// contains an unknown key.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A required field is absent.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but its value is not acceptable.
    #[error("invalid value for '{field}': {reason}")]
    InvalidField {
        /// Field name, with an index suffix for list entries (`peers[2]`).
        field: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// The `version` field names a schema this build does not understand.
    #[error("unsupported config version '{0}'")]
    UnsupportedVersion(String),

    /// Two individually valid fields contradict each other.
    #[error("conflicting values for '{field}': {reason}")]
    Conflict {
        /// The field reported as the second of the conflicting pair.
        field: String,
        /// Human-readable explanation.
        reason: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidField`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The field this error is about, when it concerns a single field.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField(field) => Some(field),
            Self::InvalidField { field, .. } | Self::Conflict { field, .. } => Some(field),
            Self::UnsupportedVersion(_) => Some("version"),
            Self::Read { .. } | Self::Parse(_) => None,
        }
    }
}
