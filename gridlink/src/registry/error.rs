use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading a single registry source.
///
/// Apart from [`RegistryError::Client`], these are per-source and
/// non-fatal: the resolver records them in the source report and carries
/// on with the registries that did load.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The configured string is not a `file://` or `http(s)://` URI.
    #[error("invalid registry uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A file registry points at a path that does not exist.
    #[error("registry file {} not found", path.display())]
    NotFound { path: PathBuf },

    /// A file registry exists but could not be read.
    #[error("failed to read registry {uri}: {reason}")]
    Read { uri: String, reason: String },

    /// The document is not a YAML sequence of node entries.
    #[error("failed to parse registry {uri}: {reason}")]
    Parse { uri: String, reason: String },

    /// The document parsed but an entry violates the node entry rules.
    #[error("invalid entry in registry {uri}: {reason}")]
    InvalidEntry { uri: String, reason: String },

    /// The HTTP request failed before a response was received.
    #[error("failed to fetch registry {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    /// The remote registry answered with a non-success status.
    #[error("registry {uri} returned HTTP {status}")]
    HttpStatus { uri: String, status: u16 },

    /// A fetch attempt exceeded the configured timeout.
    #[error("registry {uri} timed out after {timeout_ms}ms")]
    Timeout { uri: String, timeout_ms: u64 },

    /// The shared HTTP client could not be constructed.
    #[error("failed to build registry http client: {0}")]
    Client(String),
}
