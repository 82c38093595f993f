//! Catalog row types.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;
use crate::store::scope::NodeScope;

/// Current row format of `cortex_meta` values. Rows written before the
/// node-scope field carried version 1; those fail loudly at decode rather
/// than being silently misread.
pub const META_ROW_VERSION: u8 = 2;

/// Who owns a table. Ownership is derived, never stored as an ACL row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Uid(u32),
    Federated(String),
}

impl Owner {
    pub fn as_wire(&self) -> String {
        match self {
            Owner::Uid(uid) => format!("uid:{uid}"),
            Owner::Federated(fed) => format!("@{fed}"),
        }
    }
}

/// One `cortex_meta` row: everything the daemon knows about a user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub v: u8,
    pub owner: Owner,
    pub key_field: String,
    pub attributes: Vec<String>,
    pub node_scope: NodeScope,
}

impl TableMeta {
    /// Build a row from the declared attributes; the first one is the key.
    pub fn new(owner: Owner, attributes: Vec<String>, node_scope: NodeScope) -> TableMeta {
        let key_field = attributes.first().cloned().unwrap_or_default();
        TableMeta {
            v: META_ROW_VERSION,
            owner,
            key_field,
            attributes,
            node_scope,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec(self).map_err(|e| StoreError::Internal(format!("meta encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<TableMeta, StoreError> {
        let meta: TableMeta = rmp_serde::from_slice(bytes)
            .map_err(|e| StoreError::Internal(format!("meta decode: {e}")))?;
        if meta.v != META_ROW_VERSION {
            return Err(StoreError::Internal(format!(
                "unsupported meta row version {} (expected {META_ROW_VERSION})",
                meta.v
            )));
        }
        Ok(meta)
    }
}
