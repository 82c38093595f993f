//! Federated identities and the claim-token seam.
//!
//! A federated identity is a name that maps to (possibly different) local
//! UIDs on different mesh members. One node registers the name; other nodes
//! attach their own mapping by consuming a one-time claim token. Token
//! signing and verification are opaque to the store: the [`ClaimSigner`]
//! trait is the whole contract, and the bundled HMAC implementation is just
//! one way to satisfy it.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::store::StoreError;

/// One `cortex_identities` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedIdentity {
    /// node name → local UID on that node.
    pub mappings: BTreeMap<String, u32>,
    pub metadata: IdentityMetadata,
    /// Nonce of the outstanding claim token, if any. Consumed on claim.
    pub pending_claim: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMetadata {
    /// Unix seconds.
    pub created_at: u64,
    /// `uid:{n}@{node}` of the registering caller.
    pub created_by: String,
}

impl FederatedIdentity {
    pub fn new(node: &str, uid: u32) -> FederatedIdentity {
        FederatedIdentity {
            mappings: BTreeMap::from([(node.to_string(), uid)]),
            metadata: IdentityMetadata {
                created_at: unix_now(),
                created_by: format!("uid:{uid}@{node}"),
            },
            pending_claim: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec(self).map_err(|e| StoreError::Internal(format!("identity encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<FederatedIdentity, StoreError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| StoreError::Internal(format!("identity decode: {e}")))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A verified claim token's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaim {
    pub fed_id: String,
    pub nonce: String,
}

/// Opaque claim-token primitive. The store only issues and verifies.
pub trait ClaimSigner: Send + Sync {
    fn issue(&self, fed_id: &str, nonce: &str) -> String;
    fn verify(&self, token: &str) -> Result<VerifiedClaim, StoreError>;
}

/// HMAC-SHA256 token signer keyed by the mesh's shared claim secret.
///
/// Token form: `cxc1.{fed_id}.{nonce}.{hex sig}`. The fed id alphabet has no
/// dots, so the fields split unambiguously.
pub struct HmacClaimSigner {
    key: Vec<u8>,
}

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "cxc1";

impl HmacClaimSigner {
    pub fn new(key: Vec<u8>) -> HmacClaimSigner {
        HmacClaimSigner { key }
    }

    /// Use the configured mesh secret, or a process-local random key when
    /// none is configured (single-node operation: tokens then only verify
    /// on the issuing daemon).
    pub fn from_secret(secret: Option<&str>) -> HmacClaimSigner {
        match secret {
            Some(secret) => HmacClaimSigner::new(secret.as_bytes().to_vec()),
            None => {
                let mut key = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                HmacClaimSigner::new(key)
            }
        }
    }

    fn sign(&self, fed_id: &str, nonce: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(fed_id.as_bytes());
        mac.update(b".");
        mac.update(nonce.as_bytes());
        hex(&mac.finalize().into_bytes())
    }
}

impl ClaimSigner for HmacClaimSigner {
    fn issue(&self, fed_id: &str, nonce: &str) -> String {
        format!("{TOKEN_PREFIX}.{fed_id}.{nonce}.{}", self.sign(fed_id, nonce))
    }

    fn verify(&self, token: &str) -> Result<VerifiedClaim, StoreError> {
        let mut parts = token.split('.');
        let (prefix, fed_id, nonce, sig) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(p), Some(f), Some(n), Some(s), None) => (p, f, n, s),
            _ => return Err(StoreError::Unauthorized),
        };
        if prefix != TOKEN_PREFIX {
            return Err(StoreError::Unauthorized);
        }
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(fed_id.as_bytes());
        mac.update(b".");
        mac.update(nonce.as_bytes());
        let sig = unhex(sig).ok_or(StoreError::Unauthorized)?;
        mac.verify_slice(&sig).map_err(|_| StoreError::Unauthorized)?;
        Ok(VerifiedClaim {
            fed_id: fed_id.to_string(),
            nonce: nonce.to_string(),
        })
    }
}

/// Fresh claim nonce: 128 random bits, hex.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex(&bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
