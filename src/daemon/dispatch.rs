//! Request dispatch: the fixed method table.
//!
//! Every handler validates the arity and shape of its positional params
//! before touching the store, resolves the table name, authorizes, and only
//! then dispatches. Unknown methods are answered (and logged), never
//! crashed over.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;
use rmpv::Value;

use crate::auth::{self, Caller, Operation};
use crate::daemon::mesh::MeshState;
use crate::daemon::proto::RequestFrame;
use crate::daemon::repl::{PlacementBoard, ReplEvent};
use crate::store::{
    AclIdentity, NodeScope, Owner, PermissionSet, Store, StoreError, name, record,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Mesh-facing context, present only when a mesh is configured.
pub struct MeshView {
    pub state: Arc<MeshState>,
    /// Configured peer node names.
    pub peers: Vec<String>,
    pub repl_tx: Sender<ReplEvent>,
    pub placement: PlacementBoard,
}

/// Owns everything a request handler may touch. Lives on the state thread.
pub struct Dispatcher {
    store: Arc<Store>,
    mesh: Option<MeshView>,
    data_dir: String,
    started: Instant,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, mesh: Option<MeshView>, data_dir: String) -> Dispatcher {
        Dispatcher {
            store,
            mesh,
            data_dir,
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run one request. `caller` is the connection identity; the effective
    /// federated identity is resolved here, per request, so identity changes
    /// take effect without reconnecting.
    pub fn dispatch(&self, caller: &Caller, frame: &RequestFrame) -> Result<Value, StoreError> {
        let caller = self.effective(caller)?;
        let params = &frame.params;
        match frame.method.as_str() {
            "ping" => {
                arity(params, 0, 0)?;
                Ok(Value::String("pong".into()))
            }
            "status" => {
                arity(params, 0, 0)?;
                self.status()
            }
            "tables" => {
                arity(params, 0, 0)?;
                let tables = self.store.tables_for(&caller)?;
                Ok(Value::Array(
                    tables.into_iter().map(|t| Value::String(t.into())).collect(),
                ))
            }
            "create_table" => self.create_table(&caller, params),
            "drop_table" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::DropTable,
                )?;
                self.store.drop_table(&table)?;
                self.emit(ReplEvent::TableDropped { table });
                Ok(Value::String("dropped".into()))
            }
            "put" => {
                arity(params, 2, 2)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::Put,
                )?;
                let record = map_param(params, 1, "record")?;
                self.store.put(&table, record.clone())?;
                Ok(Value::String("ok".into()))
            }
            "get" => {
                arity(params, 2, 2)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::Get,
                )?;
                self.store.get(&table, &key_param(params, 1)?)
            }
            "delete" => {
                arity(params, 2, 2)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::Delete,
                )?;
                self.store.delete(&table, &key_param(params, 1)?)?;
                Ok(Value::String("ok".into()))
            }
            "match" => {
                arity(params, 2, 2)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::Match,
                )?;
                let pattern = map_param(params, 1, "pattern")?;
                Ok(Value::Array(self.store.match_records(&table, pattern)?))
            }
            "all" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::All,
                )?;
                Ok(Value::Array(self.store.all(&table)?))
            }
            "keys" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::Keys,
                )?;
                Ok(Value::Array(
                    self.store
                        .keys(&table)?
                        .into_iter()
                        .map(|k| Value::String(k.into()))
                        .collect(),
                ))
            }
            "acl_grant" => {
                let (identity, table, perms) = self.acl_params(&caller, params, Operation::AclGrant)?;
                self.store.acl_grant(&identity, &table, &perms)?;
                Ok(Value::String("granted".into()))
            }
            "acl_revoke" => {
                let (identity, table, perms) =
                    self.acl_params(&caller, params, Operation::AclRevoke)?;
                self.store.acl_revoke(&identity, &table, &perms)?;
                Ok(Value::String("revoked".into()))
            }
            "acl_list" => {
                arity(params, 0, 0)?;
                self.acl_list(&caller)
            }
            "get_scope" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::GetScope,
                )?;
                let meta = self.require_meta(&table)?;
                Ok(Value::String(meta.node_scope.as_wire().into()))
            }
            "set_scope" => {
                arity(params, 2, 2)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::SetScope,
                )?;
                let scope = NodeScope::parse(str_param(params, 1, "scope")?)?;
                self.store.set_node_scope(&table, scope.clone())?;
                self.emit(ReplEvent::ScopeChanged { table, scope });
                Ok(Value::String("ok".into()))
            }
            "table_info" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::TableInfo,
                )?;
                let meta = self.require_meta(&table)?;
                Ok(map_value(vec![
                    ("name", Value::String(table.into())),
                    ("owner", Value::String(meta.owner.as_wire().into())),
                    ("key_field", Value::String(meta.key_field.into())),
                    (
                        "attributes",
                        Value::Array(
                            meta.attributes
                                .into_iter()
                                .map(|a| Value::String(a.into()))
                                .collect(),
                        ),
                    ),
                    ("node_scope", Value::String(meta.node_scope.as_wire().into())),
                ]))
            }
            "identity_register" => {
                arity(params, 1, 1)?;
                let uid = local_uid(&caller)?;
                let fed_id = str_param(params, 0, "identity")?;
                let token = self.store.register_identity(fed_id, uid)?;
                Ok(map_value(vec![
                    ("identity", Value::String(fed_id.into())),
                    ("token", Value::String(token.into())),
                ]))
            }
            "identity_claim" => {
                arity(params, 1, 1)?;
                let uid = local_uid(&caller)?;
                let token = str_param(params, 0, "token")?;
                let fed_id = self.store.claim_identity(token, uid)?;
                Ok(map_value(vec![(
                    "identity",
                    Value::String(fed_id.into()),
                )]))
            }
            "identity_list" => {
                arity(params, 0, 0)?;
                let rows = self.store.list_identities()?;
                Ok(Value::Array(rows.into_iter().map(identity_value).collect()))
            }
            "identity_revoke" => {
                arity(params, 1, 1)?;
                // Mappings on this node belong to local users; the remote
                // surface never mutates them.
                if caller.node.is_some() {
                    return Err(StoreError::AccessDenied);
                }
                let fed_id = str_param(params, 0, "identity")?;
                self.store.revoke_identity(fed_id, &caller)?;
                Ok(Value::String("revoked".into()))
            }
            "mesh_list_nodes" => {
                arity(params, 0, 0)?;
                let mut nodes = vec![self.store.node().to_string()];
                if let Some(mesh) = &self.mesh {
                    nodes.extend(mesh.peers.iter().cloned());
                }
                Ok(Value::Array(
                    nodes.into_iter().map(|n| Value::String(n.into())).collect(),
                ))
            }
            "mesh_status" => {
                arity(params, 0, 0)?;
                self.mesh_status()
            }
            "sync_status" => {
                arity(params, 0, 0)?;
                let Some(mesh) = &self.mesh else {
                    return Ok(map_value(vec![("enabled", Value::Boolean(false))]));
                };
                let placement = mesh
                    .placement
                    .snapshot()
                    .into_iter()
                    .map(|(table, nodes)| {
                        (
                            Value::String(table.into()),
                            Value::Array(
                                nodes.into_iter().map(|n| Value::String(n.into())).collect(),
                            ),
                        )
                    })
                    .collect();
                Ok(map_value(vec![
                    ("enabled", Value::Boolean(true)),
                    ("tables", Value::Map(placement)),
                ]))
            }
            "sync_status_table" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::GetScope,
                )?;
                let replicas = match &self.mesh {
                    Some(mesh) => mesh.placement.replicas(&table),
                    None => Vec::new(),
                };
                Ok(Value::Array(
                    replicas
                        .into_iter()
                        .map(|n| Value::String(n.into()))
                        .collect(),
                ))
            }
            "sync_repair" => {
                arity(params, 1, 1)?;
                let table = self.resolve_authorized(
                    &caller,
                    str_param(params, 0, "table")?,
                    Operation::SetScope,
                )?;
                if self.mesh.is_none() {
                    return Err(StoreError::InvalidParams(
                        "replication is disabled on this node".into(),
                    ));
                }
                self.emit(ReplEvent::Repair { table });
                Ok(Value::String("ok".into()))
            }
            other => {
                tracing::warn!(method = other, "unknown method");
                Err(StoreError::InvalidRequest)
            }
        }
    }

    /// Fill in the caller's effective federated identity.
    fn effective(&self, caller: &Caller) -> Result<Caller, StoreError> {
        let mut caller = caller.clone();
        if let Some(uid) = caller.uid {
            caller.fed = match &caller.node {
                Some(node) => self.store.lookup_federated(node, uid)?,
                None => self.store.lookup_federated_by_local(uid)?,
            };
        }
        Ok(caller)
    }

    /// Resolve a wire name and authorize the operation. Resolution failures
    /// for non-root callers collapse into `access_denied` so table existence
    /// cannot be probed.
    fn resolve_authorized(
        &self,
        caller: &Caller,
        wire_name: &str,
        op: Operation,
    ) -> Result<String, StoreError> {
        let table = match self.store.resolve(caller, wire_name) {
            Ok(table) => table,
            Err(StoreError::NotFound) if !caller.is_local_root() => {
                return Err(StoreError::AccessDenied);
            }
            Err(e) => return Err(e),
        };
        auth::authorize(&self.store, caller, &table, op)?;
        Ok(table)
    }

    fn require_meta(&self, table: &str) -> Result<crate::store::TableMeta, StoreError> {
        self.store.table_meta(table)?.ok_or(StoreError::NotFound)
    }

    fn create_table(&self, caller: &Caller, params: &[Value]) -> Result<Value, StoreError> {
        arity(params, 2, 3)?;
        if caller.node.is_some() {
            // The remote surface is infrastructure, not a user.
            return Err(StoreError::AccessDenied);
        }
        let wire_name = str_param(params, 0, "name")?;
        let attrs = attrs_param(params, 1)?;
        let scope = match params.get(2) {
            Some(value) => NodeScope::parse(
                value
                    .as_str()
                    .ok_or_else(|| StoreError::InvalidParams("scope must be a string".into()))?,
            )?,
            None => NodeScope::Local,
        };
        let (internal, owner) = self.store.resolve_for_create(caller, wire_name)?;
        self.store
            .create_table(&internal, owner, attrs, scope.clone())?;
        self.emit(ReplEvent::ScopeChanged {
            table: internal,
            scope,
        });
        Ok(Value::String("created".into()))
    }

    fn acl_params(
        &self,
        caller: &Caller,
        params: &[Value],
        op: Operation,
    ) -> Result<(AclIdentity, String, PermissionSet), StoreError> {
        arity(params, 3, 3)?;
        let identity = AclIdentity::parse(str_param(params, 0, "identity")?)?;
        let table = self.resolve_authorized(caller, str_param(params, 1, "table")?, op)?;
        let perms = PermissionSet::parse_csv(str_param(params, 2, "permissions")?)?;
        Ok((identity, table, perms))
    }

    /// Root sees every row; everyone else sees rows on tables they own.
    fn acl_list(&self, caller: &Caller) -> Result<Value, StoreError> {
        let rows = self.store.acl_list()?;
        let root = caller.is_local_root();
        let owned: std::collections::BTreeSet<String> = if root {
            Default::default()
        } else {
            self.store
                .list_tables()?
                .into_iter()
                .filter(|(_, meta)| match &meta.owner {
                    Owner::Uid(uid) => caller.node.is_none() && caller.uid == Some(*uid),
                    Owner::Federated(fed) => caller.fed.as_deref() == Some(fed.as_str()),
                })
                .map(|(table, _)| table)
                .collect()
        };
        Ok(Value::Array(
            rows.into_iter()
                .filter(|row| root || owned.contains(&row.table))
                .map(|row| {
                    map_value(vec![
                        ("identity", Value::String(row.identity.into())),
                        ("table", Value::String(row.table.into())),
                        (
                            "permissions",
                            Value::String(row.permissions.as_csv().into()),
                        ),
                    ])
                })
                .collect(),
        ))
    }

    fn status(&self) -> Result<Value, StoreError> {
        Ok(map_value(vec![
            ("version", Value::String(VERSION.into())),
            ("status", Value::String("running".into())),
            ("node", Value::String(self.store.node().into())),
            ("tables", Value::Integer(self.store.table_count()?.into())),
            (
                "uptime_secs",
                Value::Integer(self.started.elapsed().as_secs().into()),
            ),
            ("data_dir", Value::String(self.data_dir.clone().into())),
        ]))
    }

    fn mesh_status(&self) -> Result<Value, StoreError> {
        let Some(mesh) = &self.mesh else {
            return Ok(map_value(vec![("enabled", Value::Boolean(false))]));
        };
        let nodes = mesh
            .state
            .snapshot()
            .into_iter()
            .map(|node| {
                (
                    Value::String(node.name.into()),
                    map_value(vec![
                        ("connected", Value::Boolean(node.connected)),
                        (
                            "last_seen_secs",
                            node.last_seen_secs
                                .map(|s| Value::Integer(s.into()))
                                .unwrap_or(Value::Nil),
                        ),
                    ]),
                )
            })
            .collect();
        Ok(map_value(vec![
            ("enabled", Value::Boolean(true)),
            ("node", Value::String(self.store.node().into())),
            ("nodes", Value::Map(nodes)),
        ]))
    }

    fn emit(&self, event: ReplEvent) {
        if let Some(mesh) = &self.mesh {
            let _ = mesh.repl_tx.send(event);
        }
    }
}

fn identity_value((fed_id, row): (String, crate::store::FederatedIdentity)) -> Value {
    // The pending claim nonce never leaves the store.
    let mappings = row
        .mappings
        .into_iter()
        .map(|(node, uid)| (Value::String(node.into()), Value::Integer(uid.into())))
        .collect();
    map_value(vec![
        ("name", Value::String(fed_id.into())),
        ("mappings", Value::Map(mappings)),
        (
            "created_at",
            Value::Integer(row.metadata.created_at.into()),
        ),
        ("created_by", Value::String(row.metadata.created_by.into())),
    ])
}

/// Identity operations bind a federated name to a kernel-verified UID, so
/// they only make sense on the local transport.
fn local_uid(caller: &Caller) -> Result<u32, StoreError> {
    if caller.node.is_some() {
        return Err(StoreError::AccessDenied);
    }
    caller.uid.ok_or(StoreError::AccessDenied)
}

fn map_value(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(
        pairs
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect(),
    )
}

fn arity(params: &[Value], min: usize, max: usize) -> Result<(), StoreError> {
    if params.len() < min || params.len() > max {
        return Err(StoreError::InvalidParams(format!(
            "expected {min}..={max} params, got {}",
            params.len()
        )));
    }
    Ok(())
}

fn str_param<'a>(params: &'a [Value], idx: usize, what: &str) -> Result<&'a str, StoreError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidParams(format!("{what} must be a string")))
}

/// Keys are scalars coerced to strings, matching the put-side coercion.
fn key_param(params: &[Value], idx: usize) -> Result<String, StoreError> {
    params
        .get(idx)
        .and_then(record::key_string)
        .ok_or_else(|| StoreError::InvalidParams("key must be a scalar".into()))
}

fn map_param<'a>(params: &'a [Value], idx: usize, what: &str) -> Result<&'a Value, StoreError> {
    match params.get(idx) {
        Some(value @ Value::Map(_)) => Ok(value),
        _ => Err(StoreError::InvalidParams(format!("{what} must be a map"))),
    }
}

fn attrs_param(params: &[Value], idx: usize) -> Result<Vec<String>, StoreError> {
    let values = params
        .get(idx)
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::InvalidParams("attributes must be an array".into()))?;
    if values.is_empty() {
        return Err(StoreError::InvalidParams(
            "attributes must not be empty".into(),
        ));
    }
    values
        .iter()
        .map(|v| {
            v.as_str()
                .filter(|s| name::is_valid_short_name(s))
                .map(str::to_string)
                .ok_or_else(|| StoreError::InvalidParams(format!("invalid attribute: {v}")))
        })
        .collect()
}
