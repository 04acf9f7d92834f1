//! # CLI Interface
//!
//! Defines the command-line argument structure for `gridlink-node` using
//! `clap` derive. Supports four subcommands: `run`, `check`, `status`,
//! and `version`.
//!
//! Every override flag also reads a `GRIDLINK_*` environment variable and
//! replaces the value from the configuration file before validation.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use gridlink::node_config::ConfigOverrides;

/// Gridlink node.
///
/// Loads a node configuration, binds the transport listeners, resolves
/// registries and keeps connections to known peers. Serves health,
/// readiness and peer status over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "gridlink-node",
    about = "Gridlink node daemon",
    version,
    propagate_version = true
)]
pub struct GridlinkNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap the node and serve until SIGINT or SIGTERM.
    Run(RunArgs),
    /// Load and validate a configuration, print the resolved summary, and exit.
    Check(CheckArgs),
    /// Query the status of a running node over its REST endpoint.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    #[arg(long, short = 'c', env = "GRIDLINK_CONFIG")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// Log output format.
    #[arg(long, value_enum, env = "GRIDLINK_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Default log directive when `RUST_LOG` is unset.
    #[arg(long, default_value = "gridlink=info,gridlink_node=info,tower_http=info")]
    pub log_level: String,
}

/// Arguments for the `check` subcommand.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Path to the node configuration file (TOML).
    #[arg(long, short = 'c', env = "GRIDLINK_CONFIG")]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: OverrideArgs,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// REST endpoint of the running node.
    #[arg(long, env = "GRIDLINK_API_URL", default_value = "http://127.0.0.1:8080")]
    pub api_url: String,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}

/// Values that replace the configuration file's values.
///
/// List flags may be repeated or comma separated; any occurrence replaces
/// the whole list from the file.
#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    #[arg(long, env = "GRIDLINK_NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "GRIDLINK_SERVICE_ENDPOINT")]
    pub service_endpoint: Option<String>,

    #[arg(long = "network-endpoint", env = "GRIDLINK_NETWORK_ENDPOINTS", value_delimiter = ',')]
    pub network_endpoints: Vec<String>,

    #[arg(long = "peer", env = "GRIDLINK_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// `raw` or `tls`.
    #[arg(long, env = "GRIDLINK_TRANSPORT")]
    pub transport: Option<String>,

    #[arg(long, env = "GRIDLINK_REST_API_ENDPOINT")]
    pub rest_api_endpoint: Option<String>,

    #[arg(long = "registry", env = "GRIDLINK_REGISTRIES", value_delimiter = ',')]
    pub registries: Vec<String>,

    #[arg(long, env = "GRIDLINK_CA_CERTS")]
    pub ca_certs: Option<PathBuf>,
}

impl OverrideArgs {
    pub fn into_overrides(self) -> ConfigOverrides {
        fn list(values: Vec<String>) -> Option<Vec<String>> {
            (!values.is_empty()).then_some(values)
        }

        ConfigOverrides {
            node_id: self.node_id,
            service_endpoint: self.service_endpoint,
            network_endpoints: list(self.network_endpoints),
            peers: list(self.peers),
            transport: self.transport,
            rest_api_endpoint: self.rest_api_endpoint,
            registries: list(self.registries),
            ca_certs: self.ca_certs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        GridlinkNodeCli::command().debug_assert();
    }

    #[test]
    fn run_overrides_replace_lists() {
        let cli = GridlinkNodeCli::try_parse_from([
            "gridlink-node",
            "run",
            "--config",
            "node.toml",
            "--peer",
            "10.0.0.1:7000,10.0.0.2:7000",
            "--transport",
            "tls",
            "--log-format",
            "json",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.log_format, LogFormatArg::Json);

        let overrides = args.overrides.into_overrides();
        assert_eq!(
            overrides.peers,
            Some(vec!["10.0.0.1:7000".to_string(), "10.0.0.2:7000".to_string()])
        );
        assert_eq!(overrides.transport.as_deref(), Some("tls"));
        assert!(overrides.registries.is_none());
        assert!(overrides.node_id.is_none());
    }

    #[test]
    fn run_requires_config() {
        // GRIDLINK_CONFIG may be set in the environment running the tests.
        if std::env::var_os("GRIDLINK_CONFIG").is_some() {
            return;
        }
        assert!(GridlinkNodeCli::try_parse_from(["gridlink-node", "run"]).is_err());
    }
}
