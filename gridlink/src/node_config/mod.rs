//! # Node Configuration
//!
//! Loads the node's TOML configuration file into a validated, immutable
//! [`NodeConfig`]. Loading is all-or-nothing: either every field satisfies
//! its rules and a `NodeConfig` comes back, or the first violation is
//! returned as a [`ConfigError`] naming the field.
//!
//! ```toml
//! version = "1"
//! node_id = "acme-node-000"
//! service_endpoint = "tcp://127.0.0.1:8043"
//! network_endpoints = ["tcps://0.0.0.0:8044"]
//! peers = ["tcps://splinterd-node-bubba:8044"]
//! transport = "tls"
//! rest_api_endpoint = "0.0.0.0:8080"
//! registries = ["file:///registry/registry.yaml"]
//! ca_certs = "/config/certs/ca.pem"
//! ```
//!
//! Values given on the command line (or through the matching environment
//! variables) are applied as [`ConfigOverrides`] on top of the file before
//! validation, so overrides are held to the same rules.

mod error;

pub use error::ConfigError;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config;
use crate::registry::RegistrySource;
use crate::transport::{Endpoint, Transport};

// ---------------------------------------------------------------------------
// Settings Groups
// ---------------------------------------------------------------------------

/// Outbound connection tuning, from the optional `[connector]` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorSettings {
    /// Budget for TCP connect, TLS handshake and hello exchange.
    pub connect_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the un-jittered delay, in `0.0..=1.0`.
    pub backoff_jitter: f64,
    /// Consecutive failures before a peer goes dormant.
    pub max_attempts: u32,
    pub dormant_sweep: Duration,
    /// Interval between liveness heartbeats on established connections.
    pub heartbeat: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: config::DEFAULT_CONNECT_TIMEOUT,
            backoff_initial: config::DEFAULT_BACKOFF_INITIAL,
            backoff_max: config::DEFAULT_BACKOFF_MAX,
            backoff_multiplier: config::DEFAULT_BACKOFF_MULTIPLIER,
            backoff_jitter: config::DEFAULT_BACKOFF_JITTER,
            max_attempts: config::DEFAULT_MAX_ATTEMPTS,
            dormant_sweep: config::DEFAULT_DORMANT_SWEEP,
            heartbeat: Duration::from_secs(config::DEFAULT_HEARTBEAT_SECS),
        }
    }
}

/// Registry fetch tuning, from the optional `[resolver]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolverSettings {
    /// Per-attempt timeout for remote registries.
    pub fetch_timeout: Duration,
    /// Attempts per remote registry per resolution round.
    pub fetch_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub retry_initial: Duration,
    /// Interval of the background refresh, `None` when disabled.
    pub auto_refresh: Option<Duration>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: config::DEFAULT_REGISTRY_FETCH_TIMEOUT,
            fetch_attempts: config::DEFAULT_REGISTRY_FETCH_ATTEMPTS,
            retry_initial: config::DEFAULT_REGISTRY_RETRY_INITIAL,
            auto_refresh: Some(Duration::from_secs(
                config::DEFAULT_REGISTRY_AUTO_REFRESH_SECS,
            )),
        }
    }
}

/// Certificate locations, fully resolved against `cert_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsPaths {
    /// CA bundle used to verify peers.
    pub ca_certs: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    /// Skip peer verification and client authentication.
    pub insecure: bool,
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Validated node configuration.
///
/// Fields are private: the only way to obtain a `NodeConfig` is through the
/// loader, so every instance satisfies the validation rules.
#[derive(Debug, Clone, Serialize)]
pub struct NodeConfig {
    version: String,
    node_id: String,
    display_name: String,
    service_endpoint: Endpoint,
    network_endpoints: Vec<Endpoint>,
    peers: Vec<Endpoint>,
    transport: Transport,
    rest_api_endpoint: Endpoint,
    registries: Vec<RegistrySource>,
    tls: Option<TlsPaths>,
    connector: ConnectorSettings,
    resolver: ResolverSettings,
}

impl NodeConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, &ConfigOverrides::default())
    }

    /// Reads the file at `path`, applies `overrides`, then validates.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml_str_with_overrides(&text, overrides)
    }

    /// Parses and validates a configuration document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::from_toml_str_with_overrides(text, &ConfigOverrides::default())
    }

    pub fn from_toml_str_with_overrides(
        text: &str,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut raw: RawNodeConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        overrides.apply(&mut raw);
        raw.validate()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn service_endpoint(&self) -> &Endpoint {
        &self.service_endpoint
    }

    pub fn network_endpoints(&self) -> &[Endpoint] {
        &self.network_endpoints
    }

    /// Statically configured peers, deduplicated, in file order.
    pub fn peers(&self) -> &[Endpoint] {
        &self.peers
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn rest_api_endpoint(&self) -> &Endpoint {
        &self.rest_api_endpoint
    }

    pub fn registries(&self) -> &[RegistrySource] {
        &self.registries
    }

    /// Certificate locations. `Some` exactly when transport is `tls`.
    pub fn tls(&self) -> Option<&TlsPaths> {
        self.tls.as_ref()
    }

    /// The CA bundle path, required iff transport is `tls`.
    pub fn ca_certs(&self) -> Option<&Path> {
        self.tls.as_ref().map(|t| t.ca_certs.as_path())
    }

    pub fn connector(&self) -> &ConnectorSettings {
        &self.connector
    }

    pub fn resolver(&self) -> &ResolverSettings {
        &self.resolver
    }
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Values that replace the file's values before validation.
///
/// List-valued overrides replace the whole list rather than appending.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub node_id: Option<String>,
    pub service_endpoint: Option<String>,
    pub network_endpoints: Option<Vec<String>>,
    pub peers: Option<Vec<String>>,
    pub transport: Option<String>,
    pub rest_api_endpoint: Option<String>,
    pub registries: Option<Vec<String>>,
    pub ca_certs: Option<PathBuf>,
}

impl ConfigOverrides {
    fn apply(&self, raw: &mut RawNodeConfig) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    raw.$field = Some(value.clone());
                }
            };
        }
        take!(node_id);
        take!(service_endpoint);
        take!(network_endpoints);
        take!(peers);
        take!(transport);
        take!(rest_api_endpoint);
        take!(registries);
        take!(ca_certs);
    }
}

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNodeConfig {
    version: Option<String>,
    node_id: Option<String>,
    display_name: Option<String>,
    service_endpoint: Option<String>,
    network_endpoints: Option<Vec<String>>,
    peers: Option<Vec<String>>,
    transport: Option<String>,
    rest_api_endpoint: Option<String>,
    registries: Option<Vec<String>>,
    ca_certs: Option<PathBuf>,
    cert_dir: Option<PathBuf>,
    tls_server_cert: Option<PathBuf>,
    tls_server_key: Option<PathBuf>,
    tls_client_cert: Option<PathBuf>,
    tls_client_key: Option<PathBuf>,
    tls_insecure: Option<bool>,
    heartbeat: Option<u64>,
    connector: Option<RawConnector>,
    resolver: Option<RawResolver>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnector {
    connect_timeout_secs: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    backoff_jitter: Option<f64>,
    max_attempts: Option<u32>,
    dormant_sweep_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResolver {
    fetch_timeout_secs: Option<u64>,
    fetch_attempts: Option<u32>,
    retry_initial_ms: Option<u64>,
    auto_refresh_secs: Option<u64>,
}

fn parse_endpoint(field: &str, value: &str) -> Result<Endpoint, ConfigError> {
    Endpoint::parse(value).map_err(|e| ConfigError::invalid(field, format!("'{}': {}", value, e)))
}

fn resolve_cert_path(cert_dir: &Path, configured: Option<PathBuf>, default: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path,
        Some(path) => cert_dir.join(path),
        None => cert_dir.join(default),
    }
}

impl RawNodeConfig {
    fn validate(self) -> Result<NodeConfig, ConfigError> {
        let version = self
            .version
            .unwrap_or_else(|| config::CONFIG_SCHEMA_VERSION.to_string());
        if version != config::CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let node_id = self.node_id.ok_or(ConfigError::MissingField("node_id"))?;
        let node_id = node_id.trim().to_string();
        if node_id.is_empty() {
            return Err(ConfigError::invalid("node_id", "must not be empty"));
        }
        if node_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid("node_id", "must not contain whitespace"));
        }
        let display_name = self.display_name.unwrap_or_else(|| node_id.clone());

        let service_endpoint = parse_endpoint(
            "service_endpoint",
            &self
                .service_endpoint
                .ok_or(ConfigError::MissingField("service_endpoint"))?,
        )?;

        let raw_network = self
            .network_endpoints
            .ok_or(ConfigError::MissingField("network_endpoints"))?;
        if raw_network.is_empty() {
            return Err(ConfigError::invalid(
                "network_endpoints",
                "at least one endpoint is required",
            ));
        }
        let mut network_endpoints = Vec::with_capacity(raw_network.len());
        for (i, value) in raw_network.iter().enumerate() {
            let field = format!("network_endpoints[{}]", i);
            let ep = parse_endpoint(&field, value)?;
            if network_endpoints.contains(&ep) {
                return Err(ConfigError::invalid(field, format!("duplicate endpoint {}", ep)));
            }
            if ep == service_endpoint && ep.port() != 0 {
                return Err(ConfigError::Conflict {
                    field,
                    reason: format!("{} is also the service_endpoint", ep),
                });
            }
            network_endpoints.push(ep);
        }

        let mut peers: Vec<Endpoint> = Vec::new();
        for (i, value) in self.peers.unwrap_or_default().iter().enumerate() {
            let field = format!("peers[{}]", i);
            let ep = parse_endpoint(&field, value)?;
            if ep.port() == 0 {
                return Err(ConfigError::invalid(field, "peer port must not be 0"));
            }
            if !peers.contains(&ep) {
                peers.push(ep);
            }
        }

        let transport: Transport = self
            .transport
            .ok_or(ConfigError::MissingField("transport"))?
            .parse()
            .map_err(|reason: String| ConfigError::invalid("transport", reason))?;

        let rest_api_endpoint = parse_endpoint(
            "rest_api_endpoint",
            &self
                .rest_api_endpoint
                .ok_or(ConfigError::MissingField("rest_api_endpoint"))?,
        )?;
        if rest_api_endpoint.port() != 0
            && (rest_api_endpoint == service_endpoint
                || network_endpoints.contains(&rest_api_endpoint))
        {
            return Err(ConfigError::Conflict {
                field: "rest_api_endpoint".to_string(),
                reason: format!("{} is already used by a transport endpoint", rest_api_endpoint),
            });
        }

        let mut registries = Vec::new();
        for (i, value) in self.registries.unwrap_or_default().iter().enumerate() {
            let source = RegistrySource::parse(value)
                .map_err(|e| ConfigError::invalid(format!("registries[{}]", i), e.to_string()))?;
            registries.push(source);
        }

        let tls = match transport {
            Transport::Raw => None,
            Transport::Tls => {
                let ca_certs = self.ca_certs.ok_or(ConfigError::MissingField("ca_certs"))?;
                if ca_certs.as_os_str().is_empty() {
                    return Err(ConfigError::invalid("ca_certs", "must not be empty"));
                }
                let cert_dir = self
                    .cert_dir
                    .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CERT_DIR));
                Some(TlsPaths {
                    ca_certs: resolve_cert_path(&cert_dir, Some(ca_certs), ""),
                    server_cert: resolve_cert_path(
                        &cert_dir,
                        self.tls_server_cert,
                        config::DEFAULT_SERVER_CERT,
                    ),
                    server_key: resolve_cert_path(
                        &cert_dir,
                        self.tls_server_key,
                        config::DEFAULT_SERVER_KEY,
                    ),
                    client_cert: resolve_cert_path(
                        &cert_dir,
                        self.tls_client_cert,
                        config::DEFAULT_CLIENT_CERT,
                    ),
                    client_key: resolve_cert_path(
                        &cert_dir,
                        self.tls_client_key,
                        config::DEFAULT_CLIENT_KEY,
                    ),
                    insecure: self.tls_insecure.unwrap_or(false),
                })
            }
        };

        let heartbeat_secs = self.heartbeat.unwrap_or(config::DEFAULT_HEARTBEAT_SECS);
        if heartbeat_secs == 0 {
            return Err(ConfigError::invalid("heartbeat", "must be greater than 0"));
        }

        let connector = self
            .connector
            .unwrap_or_default()
            .validate(Duration::from_secs(heartbeat_secs))?;
        let resolver = self.resolver.unwrap_or_default().validate()?;

        Ok(NodeConfig {
            version,
            node_id,
            display_name,
            service_endpoint,
            network_endpoints,
            peers,
            transport,
            rest_api_endpoint,
            registries,
            tls,
            connector,
            resolver,
        })
    }
}

impl RawConnector {
    fn validate(self, heartbeat: Duration) -> Result<ConnectorSettings, ConfigError> {
        let defaults = ConnectorSettings::default();

        let connect_timeout = self
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);
        if connect_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "connector.connect_timeout_secs",
                "must be greater than 0",
            ));
        }

        let backoff_initial = self
            .backoff_initial_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_initial);
        if backoff_initial.is_zero() {
            return Err(ConfigError::invalid(
                "connector.backoff_initial_ms",
                "must be greater than 0",
            ));
        }

        let backoff_max = self
            .backoff_max_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_max);
        if backoff_max < backoff_initial {
            return Err(ConfigError::Conflict {
                field: "connector.backoff_max_ms".to_string(),
                reason: "must not be smaller than backoff_initial_ms".to_string(),
            });
        }

        let backoff_multiplier = self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier);
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "connector.backoff_multiplier",
                "must be a finite number >= 1.0",
            ));
        }

        let backoff_jitter = self.backoff_jitter.unwrap_or(defaults.backoff_jitter);
        if !(0.0..=1.0).contains(&backoff_jitter) {
            return Err(ConfigError::invalid(
                "connector.backoff_jitter",
                "must be between 0.0 and 1.0",
            ));
        }

        let max_attempts = self.max_attempts.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::invalid(
                "connector.max_attempts",
                "must be at least 1",
            ));
        }

        let dormant_sweep = self
            .dormant_sweep_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.dormant_sweep);
        if dormant_sweep.is_zero() {
            return Err(ConfigError::invalid(
                "connector.dormant_sweep_secs",
                "must be greater than 0",
            ));
        }

        Ok(ConnectorSettings {
            connect_timeout,
            backoff_initial,
            backoff_max,
            backoff_multiplier,
            backoff_jitter,
            max_attempts,
            dormant_sweep,
            heartbeat,
        })
    }
}

impl RawResolver {
    fn validate(self) -> Result<ResolverSettings, ConfigError> {
        let defaults = ResolverSettings::default();

        let fetch_timeout = self
            .fetch_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.fetch_timeout);
        if fetch_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "resolver.fetch_timeout_secs",
                "must be greater than 0",
            ));
        }

        let fetch_attempts = self.fetch_attempts.unwrap_or(defaults.fetch_attempts);
        if fetch_attempts == 0 {
            return Err(ConfigError::invalid(
                "resolver.fetch_attempts",
                "must be at least 1",
            ));
        }

        let retry_initial = self
            .retry_initial_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_initial);

        // 0 disables the background refresh.
        let auto_refresh = match self.auto_refresh_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.auto_refresh,
        };

        Ok(ResolverSettings {
            fetch_timeout,
            fetch_attempts,
            retry_initial,
            auto_refresh,
        })
    }
}
