//! The record store: a transactional table engine over redb.
//!
//! One database file holds the three replicated system tables and every
//! user table. User tables are keyed by the string form of the record's
//! declared key field; values are raw MessagePack maps. Every mutation runs
//! inside a single short write transaction, so catalog work (meta row plus
//! table creation or deletion, ACL cleanup) is atomic and serialized by the
//! engine's commit protocol.

use std::path::Path;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use rmpv::Value;
use thiserror::Error;

pub mod acl;
pub mod identity;
pub mod meta;
pub mod name;
pub mod record;
pub mod scope;

pub use acl::{AclIdentity, Permission, PermissionSet};
pub use identity::{ClaimSigner, FederatedIdentity, HmacClaimSigner, VerifiedClaim};
pub use meta::{Owner, TableMeta};
pub use name::TableRef;
pub use scope::NodeScope;

use crate::auth::Caller;

const META: TableDefinition<&str, &[u8]> = TableDefinition::new("cortex_meta");
const ACLS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("cortex_acls");
const IDENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("cortex_identities");

/// The replicated system tables, in bootstrap order.
pub const SYSTEM_TABLES: [&str; 3] = ["cortex_meta", "cortex_acls", "cortex_identities"];

/// Store failures, named after the wire error taxonomy.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("access denied")]
    AccessDenied,

    #[error("invalid request")]
    InvalidRequest,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("record is missing key field {0:?}")]
    MissingKey(String),

    #[error("invalid permissions: {0}")]
    InvalidPermissions(String),

    #[error("federated identity required")]
    FederatedIdentityRequired,

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage engine fault: {0}")]
    Internal(String),
}

impl StoreError {
    /// The wire error name carried in response frames.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::AccessDenied => "access_denied",
            StoreError::InvalidRequest => "invalid_request",
            StoreError::InvalidParams(_) => "invalid_params",
            StoreError::MissingKey(_) => "missing_key",
            StoreError::InvalidPermissions(_) => "invalid_permissions",
            StoreError::FederatedIdentityRequired => "federated_identity_required",
            StoreError::Unauthorized => "unauthorized",
            StoreError::Internal(_) => "internal",
        }
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Internal(e.to_string())
    }
}

/// One ACL row as returned by `acl_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRow {
    pub identity: String,
    pub table: String,
    pub permissions: PermissionSet,
}

/// The embedded engine. Methods take `&self`; redb serializes writers.
pub struct Store {
    db: Database,
    node: String,
    signer: Box<dyn ClaimSigner>,
}

impl Store {
    /// Open (or create) the database and bootstrap the system tables.
    pub fn open(
        path: &Path,
        node: &str,
        signer: Box<dyn ClaimSigner>,
    ) -> Result<Store, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        txn.open_table(META)?;
        txn.open_table(ACLS)?;
        txn.open_table(IDENTITIES)?;
        txn.commit()?;
        Ok(Store {
            db,
            node: node.to_string(),
            signer,
        })
    }

    /// This daemon's node name (mesh identity, or `local` off-mesh).
    pub fn node(&self) -> &str {
        &self.node
    }

    // =========================================================================
    // Name resolution
    // =========================================================================

    /// Resolve a wire-level name against an existing table.
    ///
    /// Short forms derive the internal name from the caller's namespace.
    /// Fully-qualified forms are taken literally but must already exist in
    /// the catalog: resolution never mints identifiers for probed names.
    pub fn resolve(&self, caller: &Caller, wire_name: &str) -> Result<String, StoreError> {
        match TableRef::parse(wire_name)? {
            TableRef::Short(short) => match caller.uid {
                Some(uid) => Ok(name::uid_table(uid, &short)),
                None => Err(StoreError::AccessDenied),
            },
            TableRef::FedShort(short) => match &caller.fed {
                Some(fed) => Ok(name::fed_table(fed, &short)),
                None => Err(StoreError::FederatedIdentityRequired),
            },
            TableRef::QualifiedUid(uid, short) => {
                self.known(name::uid_table(uid, &short))
            }
            TableRef::QualifiedFed(fed, short) => {
                self.known(name::fed_table(&fed, &short))
            }
        }
    }

    fn known(&self, internal: String) -> Result<String, StoreError> {
        if self.table_meta(&internal)?.is_some() {
            Ok(internal)
        } else {
            Err(StoreError::NotFound)
        }
    }

    /// Resolve a wire-level name for `create_table`, yielding the owner.
    pub fn resolve_for_create(
        &self,
        caller: &Caller,
        wire_name: &str,
    ) -> Result<(String, Owner), StoreError> {
        let root = caller.is_local_root();
        match TableRef::parse(wire_name)? {
            TableRef::Short(short) => match caller.uid {
                Some(uid) => Ok((name::uid_table(uid, &short), Owner::Uid(uid))),
                None => Err(StoreError::AccessDenied),
            },
            TableRef::FedShort(short) => match &caller.fed {
                Some(fed) => Ok((name::fed_table(fed, &short), Owner::Federated(fed.clone()))),
                None => Err(StoreError::FederatedIdentityRequired),
            },
            TableRef::QualifiedUid(uid, short) => {
                if root || caller.uid == Some(uid) {
                    Ok((name::uid_table(uid, &short), Owner::Uid(uid)))
                } else {
                    Err(StoreError::Unauthorized)
                }
            }
            TableRef::QualifiedFed(fed, short) => {
                if root || caller.fed.as_deref() == Some(fed.as_str()) {
                    Ok((name::fed_table(&fed, &short), Owner::Federated(fed)))
                } else {
                    Err(StoreError::Unauthorized)
                }
            }
        }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub fn table_meta(&self, internal: &str) -> Result<Option<TableMeta>, StoreError> {
        let txn = self.db.begin_read()?;
        let metas = txn.open_table(META)?;
        match metas.get(internal)? {
            Some(guard) => Ok(Some(TableMeta::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Create the table and its catalog row in one transaction.
    pub fn create_table(
        &self,
        internal: &str,
        owner: Owner,
        attributes: Vec<String>,
        node_scope: NodeScope,
    ) -> Result<(), StoreError> {
        let meta = TableMeta::new(owner, attributes, node_scope);
        let encoded = meta.encode()?;
        let txn = self.db.begin_write()?;
        {
            let mut metas = txn.open_table(META)?;
            if metas.get(internal)?.is_some() {
                return Err(StoreError::AlreadyExists(internal.to_string()));
            }
            metas.insert(internal, encoded.as_slice())?;
            txn.open_table(TableDefinition::<&str, &[u8]>::new(internal))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Drop a table, its catalog row, and every ACL row that references it,
    /// atomically. ACL rows go first so a concurrent grant can never land on
    /// a half-dropped table.
    pub fn drop_table(&self, internal: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut acls = txn.open_table(ACLS)?;
            let mut stale = Vec::new();
            for row in acls.iter()? {
                let (key, _) = row?;
                let (identity, table) = key.value();
                if table == internal {
                    stale.push((identity.to_string(), table.to_string()));
                }
            }
            for (identity, table) in &stale {
                acls.remove((identity.as_str(), table.as_str()))?;
            }

            let mut metas = txn.open_table(META)?;
            if metas.remove(internal)?.is_none() {
                return Err(StoreError::NotFound);
            }
        }
        txn.delete_table(TableDefinition::<&str, &[u8]>::new(internal))?;
        txn.commit()?;
        Ok(())
    }

    pub fn set_node_scope(&self, internal: &str, node_scope: NodeScope) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut metas = txn.open_table(META)?;
            let mut meta = match metas.get(internal)? {
                Some(guard) => TableMeta::decode(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            meta.node_scope = node_scope;
            let encoded = meta.encode()?;
            metas.insert(internal, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Every user table and its catalog row.
    pub fn list_tables(&self) -> Result<Vec<(String, TableMeta)>, StoreError> {
        let txn = self.db.begin_read()?;
        let metas = txn.open_table(META)?;
        let mut out = Vec::new();
        for row in metas.iter()? {
            let (key, value) = row?;
            out.push((key.value().to_string(), TableMeta::decode(value.value())?));
        }
        Ok(out)
    }

    pub fn table_count(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read()?;
        let metas = txn.open_table(META)?;
        Ok(metas.len()?)
    }

    /// Wire-level table listing for one caller: short names for the caller's
    /// own namespace, qualified names for federated tables. Local root sees
    /// the whole catalog.
    pub fn tables_for(&self, caller: &Caller) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        for (internal, meta) in self.list_tables()? {
            match &meta.owner {
                Owner::Uid(uid) if caller.node.is_none() && caller.uid == Some(*uid) => {
                    let short = internal.split_once(':').map(|(_, s)| s.to_string());
                    out.push(short.unwrap_or(internal));
                }
                Owner::Federated(fed) if caller.fed.as_deref() == Some(fed.as_str()) => {
                    out.push(internal);
                }
                _ if caller.is_local_root() => out.push(internal),
                _ => {}
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub fn put(&self, internal: &str, record: Value) -> Result<(), StoreError> {
        let record = record::normalize(record);
        if record.as_map().is_none() {
            return Err(StoreError::InvalidParams("record must be a map".into()));
        }
        let txn = self.db.begin_write()?;
        {
            let metas = txn.open_table(META)?;
            let meta = match metas.get(internal)? {
                Some(guard) => TableMeta::decode(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            let key = record::record_key(&record, &meta.key_field)?;
            let bytes = record::encode(&record)?;
            let mut table = txn.open_table(TableDefinition::<&str, &[u8]>::new(internal))?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, internal: &str, key: &str) -> Result<Value, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(TableDefinition::<&str, &[u8]>::new(internal)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        match table.get(key)? {
            Some(guard) => record::decode(guard.value()),
            None => Err(StoreError::NotFound),
        }
    }

    /// Delete is idempotent over the key: removing an absent record is `ok`.
    pub fn delete(&self, internal: &str, key: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let metas = txn.open_table(META)?;
            if metas.get(internal)?.is_none() {
                return Err(StoreError::NotFound);
            }
            let mut table = txn.open_table(TableDefinition::<&str, &[u8]>::new(internal))?;
            table.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn all(&self, internal: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.scan(internal)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn keys(&self, internal: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.scan(internal)?.into_iter().map(|(k, _)| k).collect())
    }

    /// Sequential scan; no secondary indexes, O(n) by design.
    pub fn match_records(&self, internal: &str, pattern: &Value) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .scan(internal)?
            .into_iter()
            .filter(|(_, record)| record::matches(record, pattern))
            .map(|(_, v)| v)
            .collect())
    }

    fn scan(&self, internal: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(TableDefinition::<&str, &[u8]>::new(internal)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            out.push((key.value().to_string(), record::decode(value.value())?));
        }
        Ok(out)
    }

    // =========================================================================
    // ACLs
    // =========================================================================

    /// Grant merges by set union, so re-grants are idempotent.
    pub fn acl_grant(
        &self,
        identity: &AclIdentity,
        internal: &str,
        perms: &PermissionSet,
    ) -> Result<(), StoreError> {
        if perms.is_empty() {
            return Err(StoreError::InvalidPermissions("empty permission set".into()));
        }
        let subject = identity.as_key();
        let txn = self.db.begin_write()?;
        {
            let metas = txn.open_table(META)?;
            if metas.get(internal)?.is_none() {
                return Err(StoreError::NotFound);
            }
            let mut acls = txn.open_table(ACLS)?;
            let mut set = match acls.get((subject.as_str(), internal))? {
                Some(guard) => decode_perms(guard.value())?,
                None => PermissionSet::default(),
            };
            set.merge(perms);
            let bytes = encode_perms(&set)?;
            acls.insert((subject.as_str(), internal), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Revoke prunes the row when the set empties; revoking an absent row
    /// is `ok`.
    pub fn acl_revoke(
        &self,
        identity: &AclIdentity,
        internal: &str,
        perms: &PermissionSet,
    ) -> Result<(), StoreError> {
        let subject = identity.as_key();
        let txn = self.db.begin_write()?;
        {
            let mut acls = txn.open_table(ACLS)?;
            let existing = match acls.get((subject.as_str(), internal))? {
                Some(guard) => Some(decode_perms(guard.value())?),
                None => None,
            };
            if let Some(mut set) = existing {
                set.remove(perms);
                if set.is_empty() {
                    acls.remove((subject.as_str(), internal))?;
                } else {
                    let bytes = encode_perms(&set)?;
                    acls.insert((subject.as_str(), internal), bytes.as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn acl_check(
        &self,
        identity: &AclIdentity,
        internal: &str,
        perm: Permission,
    ) -> Result<bool, StoreError> {
        let subject = identity.as_key();
        let txn = self.db.begin_read()?;
        let acls = txn.open_table(ACLS)?;
        match acls.get((subject.as_str(), internal))? {
            Some(guard) => Ok(decode_perms(guard.value())?.contains(perm)),
            None => Ok(false),
        }
    }

    pub fn acl_list(&self) -> Result<Vec<AclRow>, StoreError> {
        let txn = self.db.begin_read()?;
        let acls = txn.open_table(ACLS)?;
        let mut out = Vec::new();
        for row in acls.iter()? {
            let (key, value) = row?;
            let (identity, table) = key.value();
            out.push(AclRow {
                identity: identity.to_string(),
                table: table.to_string(),
                permissions: decode_perms(value.value())?,
            });
        }
        Ok(out)
    }

    // =========================================================================
    // Federated identities
    // =========================================================================

    /// Register a federated name for a local caller and issue the one-time
    /// claim token another node's user can consume.
    pub fn register_identity(&self, fed_id: &str, caller_uid: u32) -> Result<String, StoreError> {
        if !name::is_valid_fed_id(fed_id) {
            return Err(StoreError::InvalidParams(format!(
                "invalid federated identity: {fed_id:?}"
            )));
        }
        let nonce = identity::new_nonce();
        let txn = self.db.begin_write()?;
        {
            let mut ids = txn.open_table(IDENTITIES)?;
            if ids.get(fed_id)?.is_some() {
                return Err(StoreError::AlreadyExists(fed_id.to_string()));
            }
            let mut row = FederatedIdentity::new(&self.node, caller_uid);
            row.pending_claim = Some(nonce.clone());
            let bytes = row.encode()?;
            ids.insert(fed_id, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(self.signer.issue(fed_id, &nonce))
    }

    /// Consume a claim token, attaching this node's mapping. The pending
    /// nonce is cleared so the token cannot be replayed.
    pub fn claim_identity(&self, token: &str, caller_uid: u32) -> Result<String, StoreError> {
        let claim = self.signer.verify(token)?;
        let txn = self.db.begin_write()?;
        {
            let mut ids = txn.open_table(IDENTITIES)?;
            let mut row = match ids.get(claim.fed_id.as_str())? {
                Some(guard) => FederatedIdentity::decode(guard.value())?,
                None => return Err(StoreError::Unauthorized),
            };
            if row.pending_claim.as_deref() != Some(claim.nonce.as_str()) {
                return Err(StoreError::Unauthorized);
            }
            if row.mappings.contains_key(&self.node) {
                return Err(StoreError::AlreadyExists(claim.fed_id.clone()));
            }
            row.mappings.insert(self.node.clone(), caller_uid);
            row.pending_claim = None;
            let bytes = row.encode()?;
            ids.insert(claim.fed_id.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(claim.fed_id)
    }

    /// Remove this node's mapping; the identity itself goes when the last
    /// mapping does. Only the mapped user (or local root) may revoke.
    pub fn revoke_identity(&self, fed_id: &str, caller: &Caller) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut ids = txn.open_table(IDENTITIES)?;
            let mut row = match ids.get(fed_id)? {
                Some(guard) => FederatedIdentity::decode(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            let Some(&mapped) = row.mappings.get(&self.node) else {
                return Err(StoreError::NotFound);
            };
            if !caller.is_local_root() && caller.uid != Some(mapped) {
                return Err(StoreError::AccessDenied);
            }
            row.mappings.remove(&self.node);
            if row.mappings.is_empty() {
                ids.remove(fed_id)?;
            } else {
                let bytes = row.encode()?;
                ids.insert(fed_id, bytes.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn identity(&self, fed_id: &str) -> Result<Option<FederatedIdentity>, StoreError> {
        let txn = self.db.begin_read()?;
        let ids = txn.open_table(IDENTITIES)?;
        match ids.get(fed_id)? {
            Some(guard) => Ok(Some(FederatedIdentity::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_identities(&self) -> Result<Vec<(String, FederatedIdentity)>, StoreError> {
        let txn = self.db.begin_read()?;
        let ids = txn.open_table(IDENTITIES)?;
        let mut out = Vec::new();
        for row in ids.iter()? {
            let (key, value) = row?;
            out.push((
                key.value().to_string(),
                FederatedIdentity::decode(value.value())?,
            ));
        }
        Ok(out)
    }

    /// Federated identity mapped to `uid` on `node`, if any.
    pub fn lookup_federated(&self, node: &str, uid: u32) -> Result<Option<String>, StoreError> {
        for (fed_id, row) in self.list_identities()? {
            if row.mappings.get(node) == Some(&uid) {
                return Ok(Some(fed_id));
            }
        }
        Ok(None)
    }

    /// Federated identity of a local UID on this node.
    pub fn lookup_federated_by_local(&self, uid: u32) -> Result<Option<String>, StoreError> {
        self.lookup_federated(&self.node, uid)
    }
}

fn encode_perms(set: &PermissionSet) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec(set).map_err(|e| StoreError::Internal(format!("acl encode: {e}")))
}

fn decode_perms(bytes: &[u8]) -> Result<PermissionSet, StoreError> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Internal(format!("acl decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Caller;

    fn open_store(dir: &tempfile::TempDir, node: &str) -> Store {
        let signer = Box::new(HmacClaimSigner::new(b"test-secret".to_vec()));
        Store::open(&dir.path().join("cortex.redb"), node, signer).expect("open store")
    }

    fn record(json: serde_json::Value) -> Value {
        record::from_json(&json)
    }

    fn create(store: &Store, caller: &Caller, name: &str, attrs: &[&str]) -> String {
        let (internal, owner) = store.resolve_for_create(caller, name).unwrap();
        store
            .create_table(
                &internal,
                owner,
                attrs.iter().map(|s| s.to_string()).collect(),
                NodeScope::Local,
            )
            .unwrap();
        internal
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "users", &["id", "name"]);

        let r = record(serde_json::json!({"id": "u1", "name": "alice"}));
        store.put(&table, r.clone()).unwrap();
        assert_eq!(store.get(&table, "u1").unwrap(), r);
        assert!(matches!(
            store.get(&table, "u2"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn put_requires_key_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "users", &["id"]);
        assert!(matches!(
            store.put(&table, record(serde_json::json!({"name": "x"}))),
            Err(StoreError::MissingKey(_))
        ));
    }

    #[test]
    fn integer_keys_coerce_to_strings() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "seq", &["n"]);
        store
            .put(&table, record(serde_json::json!({"n": 7, "x": true})))
            .unwrap();
        assert!(store.get(&table, "7").is_ok());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "users", &["id"]);
        store
            .put(&table, record(serde_json::json!({"id": "u1"})))
            .unwrap();
        store.delete(&table, "u1").unwrap();
        store.delete(&table, "u1").unwrap();
        assert!(store.get(&table, "u1").is_err());
    }

    #[test]
    fn match_empty_pattern_equals_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "users", &["id"]);
        for i in 0..3 {
            store
                .put(&table, record(serde_json::json!({"id": format!("u{i}")})))
                .unwrap();
        }
        let pattern = record(serde_json::json!({}));
        assert_eq!(
            store.match_records(&table, &pattern).unwrap(),
            store.all(&table).unwrap()
        );
        assert_eq!(store.keys(&table).unwrap().len(), 3);
    }

    #[test]
    fn create_collision_fails_and_recreate_after_drop_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "users", &["id"]);
        assert!(matches!(
            store.create_table(&table, Owner::Uid(1000), vec!["id".into()], NodeScope::Local),
            Err(StoreError::AlreadyExists(_))
        ));
        store.drop_table(&table).unwrap();
        create(&store, &caller, "users", &["id"]);
    }

    #[test]
    fn drop_removes_acl_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "notes", &["id"]);
        let other = create(&store, &caller, "other", &["id"]);

        let reader = AclIdentity::Uid(1001);
        let perms = PermissionSet::parse_csv("read").unwrap();
        store.acl_grant(&reader, &table, &perms).unwrap();
        store.acl_grant(&reader, &other, &perms).unwrap();

        store.drop_table(&table).unwrap();
        let rows = store.acl_list().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table, other);
    }

    #[test]
    fn grant_is_idempotent_and_revoke_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        let table = create(&store, &caller, "notes", &["id"]);
        let reader = AclIdentity::Uid(1001);
        let read = PermissionSet::parse_csv("read").unwrap();

        store.acl_grant(&reader, &table, &read).unwrap();
        store.acl_grant(&reader, &table, &read).unwrap();
        assert!(store.acl_check(&reader, &table, Permission::Read).unwrap());
        assert!(!store.acl_check(&reader, &table, Permission::Write).unwrap());

        store.acl_revoke(&reader, &table, &read).unwrap();
        assert!(store.acl_list().unwrap().is_empty());
        // Revoking again is still ok.
        store.acl_revoke(&reader, &table, &read).unwrap();
    }

    #[test]
    fn resolution_refuses_to_mint_unknown_qualified_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1001);
        assert!(matches!(
            store.resolve(&caller, "1000:ghost"),
            Err(StoreError::NotFound)
        ));
        // Short names resolve without minting anything.
        assert_eq!(store.resolve(&caller, "mine").unwrap(), "1001:mine");
        assert_eq!(store.table_count().unwrap(), 0);
    }

    #[test]
    fn fed_short_names_require_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let caller = Caller::local(1000);
        assert!(matches!(
            store.resolve(&caller, "@memories"),
            Err(StoreError::FederatedIdentityRequired)
        ));
        let mut fed_caller = Caller::local(1000);
        fed_caller.fed = Some("alice".into());
        assert_eq!(
            store.resolve(&fed_caller, "@memories").unwrap(),
            "@alice:memories"
        );
    }

    #[test]
    fn register_claim_and_lookup() {
        let dir_a = tempfile::tempdir().unwrap();
        let store_a = open_store(&dir_a, "a");

        let token = store_a.register_identity("alice", 1000).unwrap();
        assert!(matches!(
            store_a.register_identity("alice", 1000),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(
            store_a.lookup_federated("a", 1000).unwrap().as_deref(),
            Some("alice")
        );

        // Node b shares the claim secret; simulate the replicated identity
        // row arriving there, then consume the token.
        let dir_b = tempfile::tempdir().unwrap();
        let store_b = open_store(&dir_b, "b");
        let row = store_a.identity("alice").unwrap().unwrap();
        {
            let txn = store_b.db.begin_write().unwrap();
            {
                let mut ids = txn.open_table(IDENTITIES).unwrap();
                ids.insert("alice", row.encode().unwrap().as_slice()).unwrap();
            }
            txn.commit().unwrap();
        }
        let fed = store_b.claim_identity(&token, 1001).unwrap();
        assert_eq!(fed, "alice");
        assert_eq!(
            store_b.lookup_federated("b", 1001).unwrap().as_deref(),
            Some("alice")
        );
        // The token is one-time.
        assert!(store_b.claim_identity(&token, 1002).is_err());
    }

    #[test]
    fn revoke_identity_removes_mapping_then_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "a");
        store.register_identity("alice", 1000).unwrap();

        let stranger = Caller::local(1001);
        assert!(matches!(
            store.revoke_identity("alice", &stranger),
            Err(StoreError::AccessDenied)
        ));

        let owner = Caller::local(1000);
        store.revoke_identity("alice", &owner).unwrap();
        assert!(store.identity("alice").unwrap().is_none());
    }

    #[test]
    fn tables_for_lists_own_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, "local");
        let alice = Caller::local(1000);
        let bob = Caller::local(1001);
        create(&store, &alice, "users", &["id"]);
        create(&store, &bob, "users", &["id"]);

        assert_eq!(store.tables_for(&alice).unwrap(), vec!["users"]);
        assert_eq!(store.tables_for(&bob).unwrap(), vec!["users"]);
        assert_eq!(store.tables_for(&Caller::local(0)).unwrap().len(), 2);
    }
}
