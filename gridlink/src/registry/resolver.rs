//! # Registry Resolver
//!
//! Fetches every configured registry concurrently, merges the results in
//! configuration order, and publishes the merged directory as one
//! immutable snapshot.
//!
//! A registry that cannot be loaded is not an error for the node: it is
//! reported as unavailable in the snapshot's source reports and the
//! directory is built from whatever did load. A node with partial registry
//! coverage can still accept inbound peers and dial the ones it knows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::directory::RegistryDirectory;
use super::document::RegistryNode;
use super::error::RegistryError;
use super::source::{RegistrySource, SourceKind};
use crate::node_config::ResolverSettings;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of the latest load of one registry source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Available,
    Unavailable,
}

/// Per-source observability record, kept in every snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub uri: String,
    pub kind: SourceKind,
    pub status: SourceStatus,
    /// Entries the source contributed before merging.
    pub nodes: usize,
    /// Fetch attempts made in the latest round.
    pub attempts: u32,
    /// Error from the final failed attempt, if the source is unavailable.
    pub last_error: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// A complete, atomically published resolution result.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// Increments on every published resolution; 0 means "never resolved".
    pub generation: u64,
    pub directory: RegistryDirectory,
    /// One report per configured source, in configuration order.
    pub sources: Vec<SourceReport>,
    pub resolved_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// The generation-0 snapshot published before the first resolution.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            directory: RegistryDirectory::default(),
            sources: Vec::new(),
            resolved_at: Utc::now(),
        }
    }

    /// Sources that failed in the latest round.
    pub fn unavailable(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources
            .iter()
            .filter(|r| r.status == SourceStatus::Unavailable)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Loads the configured registries and owns the published snapshot.
pub struct RegistryResolver {
    sources: Vec<RegistrySource>,
    settings: ResolverSettings,
    client: reqwest::Client,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    generation: AtomicU64,
    /// Serializes resolution rounds so snapshots publish in order.
    round: tokio::sync::Mutex<()>,
}

impl RegistryResolver {
    /// Creates a resolver for `sources`, in the order they were configured.
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn new(
        sources: Vec<RegistrySource>,
        settings: ResolverSettings,
    ) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .user_agent(concat!("gridlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Client(e.to_string()))?;

        Ok(Self {
            sources,
            settings,
            client,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            generation: AtomicU64::new(0),
            round: tokio::sync::Mutex::new(()),
        })
    }

    pub fn sources(&self) -> &[RegistrySource] {
        &self.sources
    }

    /// The latest published snapshot. Never blocks on an in-flight round.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Fetches all sources concurrently, merges them, and publishes the
    /// result.
    ///
    /// Individual source failures never fail the call; they are recorded in
    /// [`RegistrySnapshot::sources`].
    pub async fn resolve(&self) -> Arc<RegistrySnapshot> {
        let _round = self.round.lock().await;

        // join_all yields results in input order, which is what makes the
        // merge independent of completion order.
        let outcomes = join_all(self.sources.iter().map(|s| self.load_source(s))).await;

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut loaded = Vec::with_capacity(outcomes.len());
        for (source, (report, nodes)) in self.sources.iter().zip(outcomes) {
            if let Some(nodes) = nodes {
                loaded.push((source.uri().to_string(), nodes));
            }
            reports.push(report);
        }

        let directory = RegistryDirectory::merge(loaded);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(RegistrySnapshot {
            generation,
            directory,
            sources: reports,
            resolved_at: Utc::now(),
        });

        let unavailable = snapshot.unavailable().count();
        info!(
            generation,
            nodes = snapshot.directory.len(),
            sources = snapshot.sources.len(),
            unavailable,
            "registry directory resolved"
        );

        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Loads one source, applying the retry policy to HTTP sources.
    async fn load_source(&self, source: &RegistrySource) -> (SourceReport, Option<Vec<RegistryNode>>) {
        let max_attempts = match source.kind() {
            SourceKind::File => 1,
            SourceKind::Http => self.settings.fetch_attempts.max(1),
        };
        let mut delay = self.settings.retry_initial;
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;
            match source.fetch(&self.client, self.settings.fetch_timeout).await {
                Ok(nodes) => {
                    debug!(registry = %source, nodes = nodes.len(), attempts, "registry loaded");
                    let report = SourceReport {
                        uri: source.uri().to_string(),
                        kind: source.kind(),
                        status: SourceStatus::Available,
                        nodes: nodes.len(),
                        attempts,
                        last_error: None,
                        fetched_at: Utc::now(),
                    };
                    return (report, Some(nodes));
                }
                Err(e) => {
                    debug!(registry = %source, attempt = attempts, error = %e, "registry fetch failed");
                    last_error = Some(e);
                    if attempts < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        let error = last_error.map(|e| e.to_string());
        warn!(
            registry = %source,
            attempts,
            error = error.as_deref().unwrap_or("unknown"),
            "registry unavailable, continuing without it"
        );
        let report = SourceReport {
            uri: source.uri().to_string(),
            kind: source.kind(),
            status: SourceStatus::Unavailable,
            nodes: 0,
            attempts,
            last_error: error,
            fetched_at: Utc::now(),
        };
        (report, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> ResolverSettings {
        ResolverSettings {
            fetch_timeout: Duration::from_millis(500),
            fetch_attempts: 3,
            retry_initial: Duration::from_millis(10),
            auto_refresh: None,
        }
    }

    fn write_registry(dir: &std::path::Path, name: &str, body: &str) -> RegistrySource {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let uri = url::Url::from_file_path(&path).unwrap().to_string();
        RegistrySource::parse(&uri).unwrap()
    }

    #[tokio::test]
    async fn no_sources_resolves_to_empty_directory() {
        let resolver = RegistryResolver::new(vec![], settings()).unwrap();
        assert_eq!(resolver.snapshot().generation, 0);

        let snapshot = resolver.resolve().await;
        assert_eq!(snapshot.generation, 1);
        assert!(snapshot.directory.is_empty());
        assert!(snapshot.sources.is_empty());
    }

    #[tokio::test]
    async fn merges_file_registries_first_seen_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_registry(
            dir.path(),
            "a.yaml",
            "- identity: n1\n  endpoints: [\"a:1\"]\n",
        );
        let b = write_registry(
            dir.path(),
            "b.yaml",
            "- identity: n1\n  endpoints: [\"b:1\"]\n- identity: n2\n  endpoints: [\"b:2\"]\n",
        );
        let resolver = RegistryResolver::new(vec![a, b], settings()).unwrap();

        let snapshot = resolver.resolve().await;
        assert_eq!(snapshot.directory.len(), 2);
        assert_eq!(snapshot.directory.get("n1").unwrap().node.endpoints[0].host(), "a");
        assert_eq!(snapshot.unavailable().count(), 0);

        // Repeat resolution yields the same mapping.
        let again = resolver.resolve().await;
        assert_eq!(again.directory, snapshot.directory);
        assert_eq!(again.generation, 2);
    }

    #[tokio::test]
    async fn unreachable_http_registry_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_registry(
            dir.path(),
            "good.yaml",
            "- identity: n1\n  endpoints: [\"a:1\"]\n",
        );

        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let bad = RegistrySource::parse(&format!("http://127.0.0.1:{}/nodes.yaml", port)).unwrap();

        let resolver = RegistryResolver::new(vec![bad, good], settings()).unwrap();
        let snapshot = resolver.resolve().await;

        assert_eq!(snapshot.directory.len(), 1);
        let reports: Vec<_> = snapshot.unavailable().collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].attempts, 3);
        assert!(reports[0].last_error.is_some());
        assert_eq!(snapshot.sources[1].status, SourceStatus::Available);
    }

    #[tokio::test]
    async fn file_sources_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let missing = write_registry(dir.path(), "tmp.yaml", "");
        if let RegistrySource::File { path, .. } = &missing {
            std::fs::remove_file(path).unwrap();
        }
        let resolver = RegistryResolver::new(vec![missing], settings()).unwrap();
        let snapshot = resolver.resolve().await;
        assert_eq!(snapshot.sources[0].status, SourceStatus::Unavailable);
        assert_eq!(snapshot.sources[0].attempts, 1);
    }
}
