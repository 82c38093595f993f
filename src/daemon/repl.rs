//! Replication driver: scope-driven table placement.
//!
//! The driver never touches record data. It reacts to catalog and
//! membership events by adding or removing replicas through the transport
//! seam, and keeps a placement board the dispatcher reads for
//! `sync_status`. Actual convergence (multi-master, last-write-wins) is the
//! transport's problem.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crossbeam::channel::Receiver;
use thiserror::Error;

use crate::store::{NodeScope, SYSTEM_TABLES, Store};

/// Events the driver consumes. Catalog events come from the state thread,
/// membership events from the TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplEvent {
    ScopeChanged { table: String, scope: NodeScope },
    TableDropped { table: String },
    NodeJoin { node: String },
    NodeLeave { node: String },
    Repair { table: String },
}

#[derive(Error, Debug)]
pub enum ReplError {
    #[error("replica transport fault: {0}")]
    Transport(String),
}

/// The black-box replicator seam: keep a set of tables converged across
/// members, nothing more. Implementations own the wire mechanics.
pub trait ReplicaTransport: Send {
    fn add_replica(&mut self, table: &str, node: &str) -> Result<(), ReplError>;
    fn remove_replica(&mut self, table: &str, node: &str) -> Result<(), ReplError>;
}

/// Default transport: records placement intent in the log. Convergence is
/// delegated to whatever external replicator is deployed alongside.
pub struct NullTransport;

impl ReplicaTransport for NullTransport {
    fn add_replica(&mut self, table: &str, node: &str) -> Result<(), ReplError> {
        tracing::info!(table, node, "add replica");
        Ok(())
    }

    fn remove_replica(&mut self, table: &str, node: &str) -> Result<(), ReplError> {
        tracing::info!(table, node, "remove replica");
        Ok(())
    }
}

/// Placement view shared between the driver thread and the dispatcher.
#[derive(Clone, Default)]
pub struct PlacementBoard {
    inner: Arc<Mutex<BTreeMap<String, BTreeSet<String>>>>,
}

impl PlacementBoard {
    pub fn new() -> PlacementBoard {
        PlacementBoard::default()
    }

    pub fn replicas(&self, table: &str) -> Vec<String> {
        self.lock()
            .get(table)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.lock()
            .iter()
            .map(|(table, nodes)| (table.clone(), nodes.iter().cloned().collect()))
            .collect()
    }

    fn add(&self, table: &str, node: &str) {
        self.lock()
            .entry(table.to_string())
            .or_default()
            .insert(node.to_string());
    }

    fn remove(&self, table: &str, node: &str) {
        let mut inner = self.lock();
        if let Some(nodes) = inner.get_mut(table) {
            nodes.remove(node);
            if nodes.is_empty() {
                inner.remove(table);
            }
        }
    }

    fn drop_table(&self, table: &str) {
        self.lock().remove(table);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeSet<String>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stateless with respect to data: placement in, placement out.
pub struct ReplDriver {
    store: Arc<Store>,
    transport: Box<dyn ReplicaTransport>,
    /// Configured peer node names (this node excluded).
    members: Vec<String>,
    board: PlacementBoard,
}

impl ReplDriver {
    pub fn new(
        store: Arc<Store>,
        transport: Box<dyn ReplicaTransport>,
        members: Vec<String>,
        board: PlacementBoard,
    ) -> ReplDriver {
        ReplDriver {
            store,
            transport,
            members,
            board,
        }
    }

    /// Consume events until the channel closes.
    pub fn run(mut self, rx: Receiver<ReplEvent>) {
        for event in rx {
            if let Err(e) = self.handle(event) {
                tracing::error!("replication driver: {e}");
            }
        }
        tracing::debug!("replication driver stopped");
    }

    fn handle(&mut self, event: ReplEvent) -> Result<(), ReplError> {
        match event {
            ReplEvent::ScopeChanged { table, scope } => self.ensure_placement(&table, &scope),
            ReplEvent::TableDropped { table } => {
                for node in self.board.replicas(&table) {
                    self.transport.remove_replica(&table, &node)?;
                }
                self.board.drop_table(&table);
                Ok(())
            }
            ReplEvent::NodeJoin { node } => self.on_node_join(&node),
            ReplEvent::NodeLeave { node } => {
                // Placement is unchanged: the engine handles partitioned
                // recovery when the member returns.
                tracing::info!(node, "mesh member down");
                Ok(())
            }
            ReplEvent::Repair { table } => self.repair(&table),
        }
    }

    /// Add/remove replicas so each member holds a copy iff in scope.
    fn ensure_placement(&mut self, table: &str, scope: &NodeScope) -> Result<(), ReplError> {
        for node in self.members.clone() {
            let holds = self.board.replicas(table).contains(&node);
            let wanted = scope.includes(&node);
            if wanted && !holds {
                self.transport.add_replica(table, &node)?;
                self.board.add(table, &node);
            } else if !wanted && holds {
                self.transport.remove_replica(table, &node)?;
                self.board.remove(table, &node);
            }
        }
        Ok(())
    }

    /// New member: replicate every system table, then each user table whose
    /// scope admits it.
    fn on_node_join(&mut self, node: &str) -> Result<(), ReplError> {
        tracing::info!(node, "mesh member up");
        for table in SYSTEM_TABLES {
            if !self.board.replicas(table).contains(&node.to_string()) {
                self.transport.add_replica(table, node)?;
                self.board.add(table, node);
            }
        }
        let tables = self
            .store
            .list_tables()
            .map_err(|e| ReplError::Transport(e.to_string()))?;
        for (table, meta) in tables {
            if meta.node_scope.includes(node) && !self.board.replicas(&table).contains(&node.to_string()) {
                self.transport.add_replica(&table, node)?;
                self.board.add(&table, node);
            }
        }
        Ok(())
    }

    /// Force re-synchronization by cycling replicas on every eligible member.
    fn repair(&mut self, table: &str) -> Result<(), ReplError> {
        let scope = match self.store.table_meta(table) {
            Ok(Some(meta)) => meta.node_scope,
            Ok(None) => return Ok(()),
            Err(e) => return Err(ReplError::Transport(e.to_string())),
        };
        for node in self.members.clone() {
            if !scope.includes(&node) {
                continue;
            }
            if self.board.replicas(table).contains(&node) {
                self.transport.remove_replica(table, &node)?;
            }
            self.transport.add_replica(table, &node)?;
            self.board.add(table, &node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Caller;
    use crate::store::{HmacClaimSigner, NodeScope};

    /// In-memory transport that records every verb for assertions.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<(String, String, bool)>>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<(String, String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ReplicaTransport for RecordingTransport {
        fn add_replica(&mut self, table: &str, node: &str) -> Result<(), ReplError> {
            self.calls
                .lock()
                .unwrap()
                .push((table.into(), node.into(), true));
            Ok(())
        }

        fn remove_replica(&mut self, table: &str, node: &str) -> Result<(), ReplError> {
            self.calls
                .lock()
                .unwrap()
                .push((table.into(), node.into(), false));
            Ok(())
        }
    }

    fn store_with_table(dir: &tempfile::TempDir, scope: NodeScope) -> (Arc<Store>, String) {
        let signer = Box::new(HmacClaimSigner::new(b"secret".to_vec()));
        let store =
            Store::open(&dir.path().join("cortex.redb"), "a", signer).expect("open store");
        let caller = Caller::local(1000);
        let (internal, owner) = store.resolve_for_create(&caller, "shared").unwrap();
        store
            .create_table(&internal, owner, vec!["id".into()], scope)
            .unwrap();
        (Arc::new(store), internal)
    }

    fn driver(
        store: Arc<Store>,
        transport: RecordingTransport,
        board: PlacementBoard,
    ) -> ReplDriver {
        ReplDriver::new(
            store,
            Box::new(transport),
            vec!["b".into(), "c".into()],
            board,
        )
    }

    #[test]
    fn scope_changes_move_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = store_with_table(&dir, NodeScope::All);
        let transport = RecordingTransport::default();
        let board = PlacementBoard::new();
        let mut driver = driver(store, transport.clone(), board.clone());

        driver
            .handle(ReplEvent::ScopeChanged {
                table: table.clone(),
                scope: NodeScope::All,
            })
            .unwrap();
        assert_eq!(board.replicas(&table), vec!["b".to_string(), "c".to_string()]);

        driver
            .handle(ReplEvent::ScopeChanged {
                table: table.clone(),
                scope: NodeScope::Nodes(vec!["b".into()]),
            })
            .unwrap();
        assert_eq!(board.replicas(&table), vec!["b".to_string()]);

        driver
            .handle(ReplEvent::ScopeChanged {
                table: table.clone(),
                scope: NodeScope::Local,
            })
            .unwrap();
        assert!(board.replicas(&table).is_empty());
        // local tables never replicate
        assert!(
            transport
                .calls()
                .iter()
                .filter(|(_, _, added)| *added)
                .count()
                >= 2
        );
    }

    #[test]
    fn node_join_replicates_system_tables_and_in_scope_tables() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = store_with_table(&dir, NodeScope::All);
        let transport = RecordingTransport::default();
        let board = PlacementBoard::new();
        let mut driver = driver(store, transport.clone(), board.clone());

        driver
            .handle(ReplEvent::NodeJoin { node: "b".into() })
            .unwrap();

        let calls = transport.calls();
        for system in SYSTEM_TABLES {
            assert!(
                calls.contains(&(system.to_string(), "b".to_string(), true)),
                "missing {system}"
            );
        }
        assert!(calls.contains(&(table.clone(), "b".to_string(), true)));
        assert_eq!(board.replicas(&table), vec!["b".to_string()]);
    }

    #[test]
    fn node_join_skips_out_of_scope_tables() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = store_with_table(&dir, NodeScope::Nodes(vec!["c".into()]));
        let transport = RecordingTransport::default();
        let mut driver = driver(store, transport.clone(), PlacementBoard::new());

        driver
            .handle(ReplEvent::NodeJoin { node: "b".into() })
            .unwrap();
        assert!(
            !transport
                .calls()
                .contains(&(table, "b".to_string(), true))
        );
    }

    #[test]
    fn repair_cycles_eligible_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = store_with_table(&dir, NodeScope::All);
        let transport = RecordingTransport::default();
        let board = PlacementBoard::new();
        let mut driver = driver(store, transport.clone(), board.clone());

        driver
            .handle(ReplEvent::ScopeChanged {
                table: table.clone(),
                scope: NodeScope::All,
            })
            .unwrap();
        driver
            .handle(ReplEvent::Repair {
                table: table.clone(),
            })
            .unwrap();

        let calls = transport.calls();
        let removes = calls
            .iter()
            .filter(|(t, _, added)| t == &table && !added)
            .count();
        assert_eq!(removes, 2);
        assert_eq!(board.replicas(&table).len(), 2);
    }

    #[test]
    fn drop_clears_placement() {
        let dir = tempfile::tempdir().unwrap();
        let (store, table) = store_with_table(&dir, NodeScope::All);
        let board = PlacementBoard::new();
        let mut driver = driver(store, RecordingTransport::default(), board.clone());

        driver
            .handle(ReplEvent::ScopeChanged {
                table: table.clone(),
                scope: NodeScope::All,
            })
            .unwrap();
        driver
            .handle(ReplEvent::TableDropped {
                table: table.clone(),
            })
            .unwrap();
        assert!(board.snapshot().is_empty());
    }
}
