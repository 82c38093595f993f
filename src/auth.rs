//! Authorization: the node-scope gate and the identity gate.
//!
//! Both gates run for every table operation unless the caller is root on the
//! local transport. Denials are uniform: a caller who may not touch a table
//! learns nothing about whether it exists.

use crate::store::{AclIdentity, Owner, Permission, Store, StoreError};

/// The resolved identity of a connection (plus the per-request federated
/// identity, filled in at dispatch time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Kernel-reported UID for local connections; forwarded origin UID for
    /// remote connections that carry one.
    pub uid: Option<u32>,
    /// Requesting node (certificate CN) for remote connections; `None` on
    /// the Unix transport.
    pub node: Option<String>,
    /// Effective federated identity, resolved from `cortex_identities`.
    pub fed: Option<String>,
}

impl Caller {
    pub fn local(uid: u32) -> Caller {
        Caller {
            uid: Some(uid),
            node: None,
            fed: None,
        }
    }

    pub fn remote(node: impl Into<String>, origin_uid: Option<u32>) -> Caller {
        Caller {
            uid: origin_uid,
            node: Some(node.into()),
            fed: None,
        }
    }

    /// Root privilege is scoped to the machine where the peer credential was
    /// obtained: UID 0 forwarded from another node carries no weight here.
    pub fn is_local_root(&self) -> bool {
        self.node.is_none() && self.uid == Some(0)
    }

    /// ACL subjects to try, most specific first. The world subject `*` is
    /// appended by the authorization check itself.
    fn acl_subjects(&self) -> Vec<AclIdentity> {
        let mut subjects = Vec::new();
        if self.node.is_none()
            && let Some(uid) = self.uid
        {
            subjects.push(AclIdentity::Uid(uid));
        }
        if let Some(fed) = &self.fed {
            subjects.push(AclIdentity::Federated(fed.clone()));
        }
        subjects
    }
}

/// Table operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Match,
    All,
    Keys,
    Put,
    Delete,
    AclGrant,
    AclRevoke,
    DropTable,
    SetScope,
    GetScope,
    TableInfo,
    /// Anything the dispatch table does not recognise. Always denied.
    Unknown,
}

impl Operation {
    fn required_permission(self) -> Option<Permission> {
        match self {
            Operation::Get
            | Operation::Match
            | Operation::All
            | Operation::Keys
            | Operation::GetScope
            | Operation::TableInfo => Some(Permission::Read),
            Operation::Put | Operation::Delete => Some(Permission::Write),
            Operation::AclGrant
            | Operation::AclRevoke
            | Operation::DropTable
            | Operation::SetScope => Some(Permission::Admin),
            Operation::Unknown => None,
        }
    }
}

/// Authorize `caller` to run `op` against `table` (an internal name).
///
/// Returns `AccessDenied` uniformly for unauthorized access and for unknown
/// tables, so unauthorized callers cannot probe table existence.
pub fn authorize(
    store: &Store,
    caller: &Caller,
    table: &str,
    op: Operation,
) -> Result<(), StoreError> {
    if caller.is_local_root() {
        return Ok(());
    }

    let Some(meta) = store.table_meta(table)? else {
        return Err(StoreError::AccessDenied);
    };

    // Node-scope gate.
    if let Some(node) = &caller.node
        && !meta.node_scope.includes(node)
    {
        return Err(StoreError::AccessDenied);
    }

    // Identity gate: the owner needs no ACL row.
    match &meta.owner {
        Owner::Uid(uid) if caller.node.is_none() && caller.uid == Some(*uid) => return Ok(()),
        Owner::Federated(fed) if caller.fed.as_deref() == Some(fed.as_str()) => return Ok(()),
        _ => {}
    }

    let Some(required) = op.required_permission() else {
        tracing::warn!(table, ?op, "denying unknown operation");
        return Err(StoreError::AccessDenied);
    };

    // A mesh member that passed the scope gate may read: holding a replica
    // of an in-scope table is exactly what the remote surface exists for.
    if caller.node.is_some() && required == Permission::Read {
        return Ok(());
    }

    for subject in caller.acl_subjects() {
        if store.acl_check(&subject, table, required)? {
            return Ok(());
        }
    }
    if store.acl_check(&AclIdentity::World, table, required)? {
        return Ok(());
    }

    Err(StoreError::AccessDenied)
}
