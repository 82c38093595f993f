//! Table-name validation and wire-level name forms.
//!
//! Short names are namespaced by the caller: `users` from UID 1000 is
//! `1000:users` inside the catalog. `@`-prefixed names live in a federated
//! identity's namespace (`@alice:memories`). Validation runs before any
//! catalog access so the store never interns an unvalidated name.

use crate::store::StoreError;

/// A parsed wire-level table reference.
///
/// Parsing is purely syntactic; resolution against the catalog (and the
/// caller's identity) happens in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRef {
    /// `users` — resolved against the caller's UID namespace.
    Short(String),
    /// `@memories` — resolved against the caller's federated identity.
    FedShort(String),
    /// `1000:users` — taken literally, must already exist.
    QualifiedUid(u32, String),
    /// `@alice:memories` — taken literally, must already exist (or be
    /// created by the owning federated identity).
    QualifiedFed(String, String),
}

impl TableRef {
    pub fn parse(name: &str) -> Result<TableRef, StoreError> {
        if let Some(rest) = name.strip_prefix('@') {
            return match rest.split_once(':') {
                None => {
                    if is_valid_fed_id(rest) {
                        Ok(TableRef::FedShort(rest.to_string()))
                    } else {
                        Err(invalid(name))
                    }
                }
                Some((fed, table)) => {
                    if is_valid_fed_id(fed) && is_valid_short_name(table) {
                        Ok(TableRef::QualifiedFed(fed.to_string(), table.to_string()))
                    } else {
                        Err(invalid(name))
                    }
                }
            };
        }

        match name.split_once(':') {
            None => {
                if is_valid_short_name(name) {
                    Ok(TableRef::Short(name.to_string()))
                } else {
                    Err(invalid(name))
                }
            }
            Some((uid_str, table)) => {
                let uid = uid_str.parse::<u32>().map_err(|_| invalid(name))?;
                // Reject leading zeros so each table has exactly one spelling.
                if uid.to_string() != uid_str || !is_valid_short_name(table) {
                    return Err(invalid(name));
                }
                Ok(TableRef::QualifiedUid(uid, table.to_string()))
            }
        }
    }

    /// Whether this reference names a federated table.
    pub fn is_federated(&self) -> bool {
        matches!(self, TableRef::FedShort(_) | TableRef::QualifiedFed(..))
    }
}

fn invalid(name: &str) -> StoreError {
    StoreError::InvalidParams(format!("invalid table name: {name:?}"))
}

/// `^[A-Za-z_][A-Za-z0-9_]*$` — short table names and attribute names.
pub fn is_valid_short_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `^[A-Za-z_][A-Za-z0-9_-]*$` — federated identity names.
pub fn is_valid_fed_id(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Internal name of a UID-namespaced table.
pub fn uid_table(uid: u32, short: &str) -> String {
    format!("{uid}:{short}")
}

/// Internal name of a federated table.
pub fn fed_table(fed: &str, short: &str) -> String {
    format!("@{fed}:{short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names() {
        assert_eq!(
            TableRef::parse("users").unwrap(),
            TableRef::Short("users".into())
        );
        assert_eq!(
            TableRef::parse("_tmp2").unwrap(),
            TableRef::Short("_tmp2".into())
        );
        assert!(TableRef::parse("2users").is_err());
        assert!(TableRef::parse("us-ers").is_err());
        assert!(TableRef::parse("").is_err());
        assert!(TableRef::parse("users.x").is_err());
    }

    #[test]
    fn qualified_uid_names() {
        assert_eq!(
            TableRef::parse("1000:users").unwrap(),
            TableRef::QualifiedUid(1000, "users".into())
        );
        assert!(TableRef::parse("01000:users").is_err());
        assert!(TableRef::parse("x:users").is_err());
        assert!(TableRef::parse("1000:").is_err());
    }

    #[test]
    fn federated_names() {
        assert_eq!(
            TableRef::parse("@memories").unwrap(),
            TableRef::FedShort("memories".into())
        );
        assert_eq!(
            TableRef::parse("@alice:memories").unwrap(),
            TableRef::QualifiedFed("alice".into(), "memories".into())
        );
        assert_eq!(
            TableRef::parse("@alice-2:notes").unwrap(),
            TableRef::QualifiedFed("alice-2".into(), "notes".into())
        );
        assert!(TableRef::parse("@").is_err());
        assert!(TableRef::parse("@1alice").is_err());
        assert!(TableRef::parse("@alice:not-ok").is_err());
    }

    #[test]
    fn validation_runs_before_any_lookup() {
        // Names with separator bytes must never reach the catalog layer.
        for bad in ["a\0b", "a b", "ACLS\n", "../x", "a:b:c"] {
            assert!(TableRef::parse(bad).is_err(), "{bad:?} accepted");
        }
    }
}
