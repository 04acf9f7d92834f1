//! # Registry Directory
//!
//! The merged view of every configured registry. Merging is
//! order-sensitive by design of the configuration: when two registries
//! list the same identity, the one listed first in `registries` wins and
//! the later entry is ignored.

use std::collections::BTreeMap;

use serde::Serialize;

use super::document::RegistryNode;

/// A node in the directory, tagged with the registry it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub node: RegistryNode,
    /// URI of the registry that contributed this entry.
    pub source: String,
}

/// Immutable node_id -> entry mapping.
///
/// Built in one go by [`RegistryDirectory::merge`]; never mutated after
/// construction, so a published directory can be shared freely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryDirectory {
    entries: BTreeMap<String, DirectoryEntry>,
    /// Entries dropped because an earlier registry already defined them.
    shadowed: usize,
}

impl RegistryDirectory {
    /// Merges per-source node lists in the given order (first-seen wins).
    ///
    /// The input order must be the configured registry order, not the
    /// order in which fetches happened to complete.
    pub fn merge<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<RegistryNode>)>,
    {
        let mut entries = BTreeMap::new();
        let mut shadowed = 0;

        for (source, nodes) in sources {
            for node in nodes {
                if entries.contains_key(&node.identity) {
                    shadowed += 1;
                    tracing::debug!(
                        node_id = %node.identity,
                        registry = %source,
                        "identity already provided by an earlier registry"
                    );
                    continue;
                }
                entries.insert(
                    node.identity.clone(),
                    DirectoryEntry {
                        node,
                        source: source.clone(),
                    },
                );
            }
        }

        Self { entries, shadowed }
    }

    pub fn get(&self, node_id: &str) -> Option<&DirectoryEntry> {
        self.entries.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in node_id order.
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of later duplicates ignored during the merge.
    pub fn shadowed(&self) -> usize {
        self.shadowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;

    fn node(id: &str, endpoint: &str) -> RegistryNode {
        RegistryNode {
            identity: id.to_string(),
            endpoints: vec![Endpoint::parse(endpoint).unwrap()],
            display_name: None,
            keys: vec![],
            metadata: Default::default(),
        }
    }

    #[test]
    fn first_registry_wins_on_conflict() {
        let dir = RegistryDirectory::merge(vec![
            ("file:///a.yaml".to_string(), vec![node("n1", "a:1")]),
            (
                "file:///b.yaml".to_string(),
                vec![node("n1", "b:1"), node("n2", "b:2")],
            ),
        ]);

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.shadowed(), 1);
        let n1 = dir.get("n1").unwrap();
        assert_eq!(n1.source, "file:///a.yaml");
        assert_eq!(n1.node.endpoints[0].host(), "a");
        assert_eq!(dir.get("n2").unwrap().source, "file:///b.yaml");
    }

    #[test]
    fn merge_is_deterministic() {
        let input = || {
            vec![
                ("r1".to_string(), vec![node("z", "z:1"), node("a", "a:1")]),
                ("r2".to_string(), vec![node("a", "x:1"), node("m", "m:1")]),
            ]
        };
        let first = RegistryDirectory::merge(input());
        for _ in 0..10 {
            assert_eq!(RegistryDirectory::merge(input()), first);
        }
        let ids: Vec<&str> = first.node_ids().collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }

    #[test]
    fn registry_order_changes_the_winner() {
        let forward = RegistryDirectory::merge(vec![
            ("r1".to_string(), vec![node("n", "one:1")]),
            ("r2".to_string(), vec![node("n", "two:1")]),
        ]);
        let reversed = RegistryDirectory::merge(vec![
            ("r2".to_string(), vec![node("n", "two:1")]),
            ("r1".to_string(), vec![node("n", "one:1")]),
        ]);
        assert_eq!(forward.get("n").unwrap().source, "r1");
        assert_eq!(reversed.get("n").unwrap().source, "r2");
    }
}
