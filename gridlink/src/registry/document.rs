//! # Registry Documents
//!
//! A registry document is a YAML sequence of node entries. File and HTTP
//! registries serve the same format:
//!
//! ```yaml
//! - identity: acme-node-000
//!   endpoints:
//!     - tcps://splinterd-node-acme:8044
//!   display_name: Acme Node
//!   keys:
//!     - 0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798
//!   metadata:
//!     organization: Acme Corporation
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::RegistryError;
use crate::transport::Endpoint;

/// One node entry from a registry document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryNode {
    /// Node id, unique within a cluster.
    pub identity: String,
    /// Network endpoints the node accepts peer connections on, in
    /// preference order.
    pub endpoints: Vec<Endpoint>,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Public keys the node may authenticate with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Free-form key/value metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Parses and validates a registry document.
///
/// Any malformed entry rejects the whole document: a registry that is
/// half right is not trusted for the other half either. Duplicate
/// identities inside one document keep their first occurrence, the same
/// rule the directory applies across documents.
pub fn parse_document(uri: &str, text: &str) -> Result<Vec<RegistryNode>, RegistryError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let nodes: Vec<RegistryNode> =
        serde_yaml::from_str(text).map_err(|e| RegistryError::Parse {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;

    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(nodes.len());
    for (index, node) in nodes.into_iter().enumerate() {
        if node.identity.trim().is_empty() {
            return Err(RegistryError::InvalidEntry {
                uri: uri.to_string(),
                reason: format!("entry {} has an empty identity", index),
            });
        }
        if node.endpoints.is_empty() {
            return Err(RegistryError::InvalidEntry {
                uri: uri.to_string(),
                reason: format!("node '{}' lists no endpoints", node.identity),
            });
        }
        if let Some(ep) = node.endpoints.iter().find(|ep| ep.port() == 0) {
            return Err(RegistryError::InvalidEntry {
                uri: uri.to_string(),
                reason: format!("node '{}' endpoint {} has port 0", node.identity, ep),
            });
        }
        if seen.insert(node.identity.clone()) {
            accepted.push(node);
        } else {
            tracing::warn!(
                registry = uri,
                node_id = %node.identity,
                "duplicate identity in registry document, keeping first entry"
            );
        }
    }

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
- identity: acme-node-000
  endpoints:
    - tcps://splinterd-node-acme:8044
  display_name: Acme Node
  keys:
    - "0279be66"
  metadata:
    organization: Acme Corporation
- identity: bubba-node-000
  endpoints:
    - 10.0.0.2:8044
    - 10.0.0.3:8044
"#;

    #[test]
    fn parses_full_and_minimal_entries() {
        let nodes = parse_document("file:///r.yaml", DOC).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].identity, "acme-node-000");
        assert_eq!(nodes[0].endpoints[0].to_string(), "splinterd-node-acme:8044");
        assert_eq!(nodes[0].display_name.as_deref(), Some("Acme Node"));
        assert_eq!(nodes[0].metadata["organization"], "Acme Corporation");
        assert_eq!(nodes[1].endpoints.len(), 2);
        assert!(nodes[1].keys.is_empty());
    }

    #[test]
    fn empty_document_is_an_empty_registry() {
        assert!(parse_document("file:///r.yaml", "  \n").unwrap().is_empty());
    }

    #[test]
    fn entry_without_endpoints_rejects_document() {
        let doc = "- identity: lonely\n  endpoints: []\n";
        let err = parse_document("file:///r.yaml", doc).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidEntry { .. }));
    }

    #[test]
    fn bad_endpoint_is_a_parse_error() {
        let doc = "- identity: a\n  endpoints: [\"no-port\"]\n";
        let err = parse_document("file:///r.yaml", doc).unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[test]
    fn duplicate_identity_keeps_first() {
        let doc = "- identity: a\n  endpoints: [\"h1:1\"]\n- identity: a\n  endpoints: [\"h2:2\"]\n";
        let nodes = parse_document("file:///r.yaml", doc).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].endpoints[0].host(), "h1");
    }
}
