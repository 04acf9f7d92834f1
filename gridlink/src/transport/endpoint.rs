//! # Endpoints
//!
//! `host:port` addresses as they appear in the node configuration and in
//! registry documents. An optional `tcp://` or `tcps://` scheme prefix is
//! accepted for compatibility with registries that carry it; the scheme is
//! informational only, the node-wide [`Transport`] decides whether TLS is
//! used.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transport Mode
// ---------------------------------------------------------------------------

/// Connection security mode for every listener and outbound dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain TCP.
    Raw,
    /// TCP wrapped in TLS, with certificates from the CertificateStore.
    Tls,
}

impl Transport {
    /// Stable lowercase tag, matching the configuration file value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Raw => "raw",
            Transport::Tls => "tls",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Transport::Raw),
            "tls" => Ok(Transport::Tls),
            other => Err(format!("unknown transport '{}', expected 'raw' or 'tls'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A parsed `host:port` pair.
///
/// IPv6 literals are written in brackets (`[::1]:8044`); the brackets are
/// stripped from `host` and restored by `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Builds an endpoint from parts. The host must be non-empty.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, EndpointParseError> {
        let host = host.into();
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        Ok(Self { host, port })
    }

    /// Parses `host:port`, `[v6]:port`, or either with a `tcp://` / `tcps://`
    /// prefix.
    pub fn parse(input: &str) -> Result<Self, EndpointParseError> {
        let trimmed = input.trim();
        let rest = match trimmed.split_once("://") {
            Some(("tcp", rest)) | Some(("tcps", rest)) => rest,
            Some((scheme, _)) => {
                return Err(EndpointParseError::UnsupportedScheme(scheme.to_string()))
            }
            None => trimmed,
        };

        let (host, port) = if let Some(after_bracket) = rest.strip_prefix('[') {
            let (host, tail) = after_bracket
                .split_once(']')
                .ok_or(EndpointParseError::MissingPort)?;
            let port = tail.strip_prefix(':').ok_or(EndpointParseError::MissingPort)?;
            (host, port)
        } else {
            let (host, port) = rest.rsplit_once(':').ok_or(EndpointParseError::MissingPort)?;
            if host.contains(':') {
                // Unbracketed IPv6 is ambiguous with the port separator.
                return Err(EndpointParseError::InvalidHost(host.to_string()));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(EndpointParseError::InvalidHost(host.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(port.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port. Zero means "let the OS choose" when binding.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address tuple accepted by `tokio::net::TcpListener::bind` and
    /// `TcpStream::connect`.
    pub fn socket_tuple(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Endpoint::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Reasons a `host:port` string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("missing ':port' suffix")]
    MissingPort,
    #[error("empty host")]
    EmptyHost,
    #[error("invalid host '{0}'")]
    InvalidHost(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("unsupported endpoint scheme '{0}://', expected tcp:// or tcps://")]
    UnsupportedScheme(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host_port() {
        let ep = Endpoint::parse("splinterd-node:8044").unwrap();
        assert_eq!(ep.host(), "splinterd-node");
        assert_eq!(ep.port(), 8044);
        assert_eq!(ep.to_string(), "splinterd-node:8044");
    }

    #[test]
    fn strips_tcp_schemes() {
        assert_eq!(
            Endpoint::parse("tcps://10.0.0.1:8044").unwrap(),
            Endpoint::parse("10.0.0.1:8044").unwrap()
        );
        assert_eq!(Endpoint::parse("tcp://a:1").unwrap().host(), "a");
    }

    #[test]
    fn rejects_foreign_scheme() {
        assert_eq!(
            Endpoint::parse("http://a:1"),
            Err(EndpointParseError::UnsupportedScheme("http".into()))
        );
    }

    #[test]
    fn bracketed_ipv6_round_trips_through_display() {
        let ep = Endpoint::parse("[::1]:9000").unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:9000");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(Endpoint::parse("localhost"), Err(EndpointParseError::MissingPort));
        assert_eq!(Endpoint::parse(":80"), Err(EndpointParseError::EmptyHost));
        assert!(matches!(
            Endpoint::parse("host:99999"),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("::1:80"),
            Err(EndpointParseError::InvalidHost(_))
        ));
    }

    #[test]
    fn transport_parses_known_values_only() {
        assert_eq!("raw".parse::<Transport>(), Ok(Transport::Raw));
        assert_eq!("tls".parse::<Transport>(), Ok(Transport::Tls));
        assert!("TLS".parse::<Transport>().is_err());
        assert!("quic".parse::<Transport>().is_err());
    }
}
