//! Mesh membership state.
//!
//! Tracks which configured peers currently hold authenticated connections
//! to this daemon. The TLS listener updates it; `mesh_status` reads it; the
//! replication driver receives join/leave events derived from it.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// Live view of configured peers. Nodes not in the mesh config never appear
/// here: unknown certificate CNs are refused before this point.
pub struct MeshState {
    nodes: Mutex<BTreeMap<String, NodeStatus>>,
}

#[derive(Debug, Clone, Default)]
struct NodeStatus {
    connections: usize,
    last_seen: Option<Instant>,
}

/// One row of `mesh_status` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub connected: bool,
    pub last_seen_secs: Option<u64>,
}

impl MeshState {
    pub fn new(peers: impl IntoIterator<Item = String>) -> MeshState {
        MeshState {
            nodes: Mutex::new(
                peers
                    .into_iter()
                    .map(|name| (name, NodeStatus::default()))
                    .collect(),
            ),
        }
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.lock().contains_key(node)
    }

    /// Record an authenticated connection. Returns true when this is the
    /// node's first live connection (a membership-up edge).
    pub fn connected(&self, node: &str) -> bool {
        let mut nodes = self.lock();
        let Some(status) = nodes.get_mut(node) else {
            return false;
        };
        status.connections += 1;
        status.last_seen = Some(Instant::now());
        status.connections == 1
    }

    /// Record a closed connection. Returns true when it was the node's last
    /// one (a membership-down edge).
    pub fn disconnected(&self, node: &str) -> bool {
        let mut nodes = self.lock();
        let Some(status) = nodes.get_mut(node) else {
            return false;
        };
        status.connections = status.connections.saturating_sub(1);
        status.last_seen = Some(Instant::now());
        status.connections == 0
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.lock()
            .iter()
            .map(|(name, status)| NodeSnapshot {
                name: name.clone(),
                connected: status.connections > 0,
                last_seen_secs: status.last_seen.map(|t| t.elapsed().as_secs()),
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, NodeStatus>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_edges() {
        let mesh = MeshState::new(["b".to_string(), "c".to_string()]);
        assert!(mesh.is_member("b"));
        assert!(!mesh.is_member("z"));

        assert!(mesh.connected("b"));
        assert!(!mesh.connected("b")); // second connection, no edge
        assert!(!mesh.disconnected("b"));
        assert!(mesh.disconnected("b")); // last one out

        // Unknown nodes never produce edges.
        assert!(!mesh.connected("z"));
    }

    #[test]
    fn snapshot_reflects_connections() {
        let mesh = MeshState::new(["b".to_string()]);
        let before = mesh.snapshot();
        assert!(!before[0].connected);
        assert_eq!(before[0].last_seen_secs, None);

        mesh.connected("b");
        let after = mesh.snapshot();
        assert!(after[0].connected);
        assert!(after[0].last_seen_secs.is_some());
    }
}
