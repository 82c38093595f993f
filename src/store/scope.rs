//! Per-table node scopes.
//!
//! The scope declares which mesh members may hold a copy of a table. It is
//! stored in the catalog and drives both the remote-request authorization
//! gate and the replication driver's placement decisions.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Which mesh members may hold a copy of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeScope {
    /// Never replicated off this machine.
    Local,
    /// A copy on every mesh member.
    All,
    /// Copies restricted to the named members.
    Nodes(Vec<String>),
}

impl NodeScope {
    /// Parse the wire form: `"local"`, `"all"`, or a comma-separated node list.
    pub fn parse(s: &str) -> Result<NodeScope, StoreError> {
        match s {
            "local" => Ok(NodeScope::Local),
            "all" => Ok(NodeScope::All),
            other => {
                let nodes: Vec<String> = other
                    .split(',')
                    .map(|n| n.trim().to_string())
                    .collect();
                if nodes.iter().any(|n| !is_valid_node_name(n)) {
                    return Err(StoreError::InvalidParams(format!(
                        "invalid node scope: {s:?}"
                    )));
                }
                Ok(NodeScope::Nodes(nodes))
            }
        }
    }

    /// Wire rendering, the inverse of [`NodeScope::parse`].
    pub fn as_wire(&self) -> String {
        match self {
            NodeScope::Local => "local".to_string(),
            NodeScope::All => "all".to_string(),
            NodeScope::Nodes(nodes) => nodes.join(","),
        }
    }

    /// Whether `node` is allowed to hold a copy of a table with this scope.
    pub fn includes(&self, node: &str) -> bool {
        match self {
            NodeScope::Local => false,
            NodeScope::All => true,
            NodeScope::Nodes(nodes) => nodes.iter().any(|n| n == node),
        }
    }

    /// Whether the table leaves this machine at all.
    pub fn replicates(&self) -> bool {
        !matches!(self, NodeScope::Local)
    }
}

impl Default for NodeScope {
    fn default() -> Self {
        NodeScope::Local
    }
}

/// Node names come from mesh config and certificate CNs: hostname-shaped.
pub fn is_valid_node_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for wire in ["local", "all", "a", "a,b.internal,c-3"] {
            assert_eq!(NodeScope::parse(wire).unwrap().as_wire(), wire);
        }
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", ",", "a,,b", "a b", "LOCAL;x"] {
            assert!(NodeScope::parse(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn membership() {
        assert!(!NodeScope::Local.includes("a"));
        assert!(NodeScope::All.includes("anything"));
        let listed = NodeScope::Nodes(vec!["a".into(), "b".into()]);
        assert!(listed.includes("a"));
        assert!(!listed.includes("c"));
    }

    #[test]
    fn local_never_replicates() {
        assert!(!NodeScope::Local.replicates());
        assert!(NodeScope::All.replicates());
        assert!(NodeScope::Nodes(vec!["a".into()]).replicates());
    }
}
