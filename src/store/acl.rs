//! Permissions and ACL identity subjects.
//!
//! An ACL row grants a set of permissions to one identity on one table.
//! Identities are `uid:{n}` for local users, `*` for the world, or a
//! federated identity name. The table owner needs no row: ownership is
//! derived from the catalog.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;
use crate::store::name::is_valid_fed_id;

/// A single grantable permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn parse(s: &str) -> Option<Permission> {
        match s {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }
}

/// The permission set attached to one `(identity, table)` pair.
///
/// Grants merge by set union; a revoke that empties the set deletes the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// Parse the wire form: a comma-separated list such as `"read,write"`.
    pub fn parse_csv(s: &str) -> Result<PermissionSet, StoreError> {
        let mut set = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            match Permission::parse(part) {
                Some(perm) => {
                    set.insert(perm);
                }
                None => {
                    return Err(StoreError::InvalidPermissions(format!(
                        "unknown permission: {part:?}"
                    )));
                }
            }
        }
        Ok(PermissionSet(set))
    }

    pub fn contains(&self, perm: Permission) -> bool {
        self.0.contains(&perm)
    }

    pub fn merge(&mut self, other: &PermissionSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn remove(&mut self, other: &PermissionSet) {
        for perm in &other.0 {
            self.0.remove(perm);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_csv(&self) -> String {
        self.0
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = Permission>>(iter: T) -> Self {
        PermissionSet(iter.into_iter().collect())
    }
}

/// The identity subject of an ACL row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclIdentity {
    Uid(u32),
    World,
    Federated(String),
}

impl AclIdentity {
    pub fn parse(s: &str) -> Result<AclIdentity, StoreError> {
        if s == "*" {
            return Ok(AclIdentity::World);
        }
        if let Some(uid) = s.strip_prefix("uid:") {
            return uid
                .parse::<u32>()
                .map(AclIdentity::Uid)
                .map_err(|_| invalid(s));
        }
        if is_valid_fed_id(s) {
            return Ok(AclIdentity::Federated(s.to_string()));
        }
        Err(invalid(s))
    }

    /// The catalog key form, also used on the wire.
    pub fn as_key(&self) -> String {
        match self {
            AclIdentity::Uid(uid) => format!("uid:{uid}"),
            AclIdentity::World => "*".to_string(),
            AclIdentity::Federated(fed) => fed.clone(),
        }
    }
}

fn invalid(s: &str) -> StoreError {
    StoreError::InvalidParams(format!("invalid ACL identity: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_accepts_known_permissions() {
        let set = PermissionSet::parse_csv("read, write").unwrap();
        assert!(set.contains(Permission::Read));
        assert!(set.contains(Permission::Write));
        assert!(!set.contains(Permission::Admin));
        assert_eq!(set.as_csv(), "read,write");
    }

    #[test]
    fn parse_csv_rejects_unknown() {
        assert!(matches!(
            PermissionSet::parse_csv("read,chmod"),
            Err(StoreError::InvalidPermissions(_))
        ));
        assert!(PermissionSet::parse_csv("").is_err());
    }

    #[test]
    fn merge_is_union_and_remove_prunes() {
        let mut set = PermissionSet::parse_csv("read").unwrap();
        set.merge(&PermissionSet::parse_csv("read,write").unwrap());
        assert_eq!(set.as_csv(), "read,write");
        set.remove(&PermissionSet::parse_csv("write,admin").unwrap());
        assert_eq!(set.as_csv(), "read");
        set.remove(&PermissionSet::parse_csv("read").unwrap());
        assert!(set.is_empty());
    }

    #[test]
    fn identity_forms() {
        assert_eq!(AclIdentity::parse("uid:1001").unwrap(), AclIdentity::Uid(1001));
        assert_eq!(AclIdentity::parse("*").unwrap(), AclIdentity::World);
        assert_eq!(
            AclIdentity::parse("alice").unwrap(),
            AclIdentity::Federated("alice".into())
        );
        assert!(AclIdentity::parse("uid:alice").is_err());
        assert!(AclIdentity::parse("no spaces").is_err());
        assert_eq!(AclIdentity::Uid(7).as_key(), "uid:7");
    }
}
