//! # Registry Sources
//!
//! The closed set of places a registry document can come from. Each
//! variant knows how to fetch its document once; retry policy belongs to
//! the resolver.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::document::{parse_document, RegistryNode};
use super::error::RegistryError;

/// Which variant a source is, for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Http,
}

/// A configured registry location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    /// A local YAML document, read synchronously.
    File { uri: String, path: PathBuf },
    /// A YAML document served over HTTP or HTTPS.
    Http { uri: String, url: Url },
}

impl RegistrySource {
    /// Parses a configured registry string. Only `file://`, `http://` and
    /// `https://` URIs are accepted.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| invalid("file uri must be an absolute local path"))?;
                Ok(Self::File {
                    uri: raw.trim().to_string(),
                    path,
                })
            }
            "http" | "https" => {
                if url.host_str().map_or(true, str::is_empty) {
                    return Err(invalid("http uri has no host"));
                }
                Ok(Self::Http {
                    uri: raw.trim().to_string(),
                    url,
                })
            }
            other => Err(invalid(&format!(
                "unsupported scheme '{}', expected file, http or https",
                other
            ))),
        }
    }

    /// The URI exactly as configured.
    pub fn uri(&self) -> &str {
        match self {
            Self::File { uri, .. } | Self::Http { uri, .. } => uri,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::File { .. } => SourceKind::File,
            Self::Http { .. } => SourceKind::Http,
        }
    }

    /// Fetches and parses the document once.
    ///
    /// File sources ignore `client` and `timeout`; HTTP sources apply the
    /// timeout to the whole request including the body.
    pub async fn fetch(
        &self,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<RegistryNode>, RegistryError> {
        match self {
            Self::File { uri, path } => {
                let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => RegistryError::NotFound { path: path.clone() },
                    _ => RegistryError::Read {
                        uri: uri.clone(),
                        reason: e.to_string(),
                    },
                })?;
                parse_document(uri, &text)
            }
            Self::Http { uri, url } => {
                let request = async {
                    let response = client.get(url.clone()).send().await.map_err(|e| {
                        RegistryError::Fetch {
                            uri: uri.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(RegistryError::HttpStatus {
                            uri: uri.clone(),
                            status: status.as_u16(),
                        });
                    }
                    response.text().await.map_err(|e| RegistryError::Fetch {
                        uri: uri.clone(),
                        reason: e.to_string(),
                    })
                };
                let text = tokio::time::timeout(timeout, request)
                    .await
                    .map_err(|_| RegistryError::Timeout {
                        uri: uri.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })??;
                parse_document(uri, &text)
            }
        }
    }
}

impl fmt::Display for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uri())
    }
}

impl Serialize for RegistrySource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.uri())
    }
}
