//! Secret vault: exclusive custody of order secrets.
//!
//! Secrets enter the vault either minted at admission or uploaded by
//! the buyer, and leave it exactly once per (order, segment?) scope,
//! only after the escrow verifier has asserted both sides funded. The
//! release entry is appended to the log before the secret is handed to
//! the caller, so a crash between the two leaves the log conservative.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use hashlock::{hash_leaf, Bytes32};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("escrows not verified for order {order_id}, segment {segment_id:?}")]
    NotVerified { order_id: String, segment_id: Option<u8> },
    #[error("secret already released for order {order_id}, segment {segment_id:?}")]
    AlreadyReleased { order_id: String, segment_id: Option<u8> },
    #[error("no secret held for order {order_id}, segment {segment_id:?}")]
    UnknownSecret { order_id: String, segment_id: Option<u8> },
    #[error("secret does not match the registered hashlock for order {order_id}")]
    HashMismatch { order_id: String },
}

/// Scope of one secret: the whole order, or one segment of it.
pub type SecretScope = (String, Option<u8>);

/// Append-only release record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRelease {
    pub order_id: String,
    pub segment_id: Option<u8>,
    pub released_to: String,
    pub released_at: DateTime<Utc>,
}

#[derive(Default)]
struct VaultState {
    secrets: HashMap<SecretScope, Bytes32>,
    verified: HashSet<SecretScope>,
    released: HashSet<SecretScope>,
    log: Vec<SecretRelease>,
}

/// Vault over all order secrets. A single async mutex serializes
/// releases so at-most-once holds under concurrent requests.
pub struct SecretVault {
    state: Mutex<VaultState>,
}

impl SecretVault {
    pub fn new() -> Self {
        SecretVault {
            state: Mutex::new(VaultState::default()),
        }
    }

    /// Store a coordinator-minted single-order secret.
    pub async fn store_single(&self, order_id: &str, secret: Bytes32) {
        let mut state = self.state.lock().await;
        state.secrets.insert((order_id.to_string(), None), secret);
    }

    /// Store coordinator-minted segment secrets, 1-indexed.
    pub async fn store_segmented(&self, order_id: &str, secrets: &[Bytes32]) {
        let mut state = self.state.lock().await;
        for (index, secret) in secrets.iter().enumerate() {
            state
                .secrets
                .insert((order_id.to_string(), Some(index as u8 + 1)), *secret);
        }
    }

    /// Register a buyer-uploaded secret for a single order, validating
    /// it against the order's hashlock.
    pub async fn register_single(
        &self,
        order_id: &str,
        secret: Bytes32,
        hash_lock: &Bytes32,
    ) -> Result<(), VaultError> {
        if hash_leaf(&secret) != *hash_lock {
            return Err(VaultError::HashMismatch {
                order_id: order_id.to_string(),
            });
        }
        let mut state = self.state.lock().await;
        state.secrets.insert((order_id.to_string(), None), secret);
        Ok(())
    }

    /// Register a buyer-uploaded segment secret against its leaf hash.
    pub async fn register_segment(
        &self,
        order_id: &str,
        segment_id: u8,
        secret: Bytes32,
        leaf_hash: &Bytes32,
    ) -> Result<(), VaultError> {
        if hash_leaf(&secret) != *leaf_hash {
            return Err(VaultError::HashMismatch {
                order_id: order_id.to_string(),
            });
        }
        let mut state = self.state.lock().await;
        state
            .secrets
            .insert((order_id.to_string(), Some(segment_id)), secret);
        Ok(())
    }

    /// Record that the escrow verifier asserted both sides funded for
    /// a scope. Only after this does `release` succeed.
    pub async fn mark_verified(&self, order_id: &str, segment_id: Option<u8>) {
        let mut state = self.state.lock().await;
        state.verified.insert((order_id.to_string(), segment_id));
    }

    /// Release the secret for a scope, at most once.
    pub async fn release(
        &self,
        order_id: &str,
        segment_id: Option<u8>,
        released_to: &str,
    ) -> Result<Bytes32, VaultError> {
        let scope: SecretScope = (order_id.to_string(), segment_id);
        let mut state = self.state.lock().await;

        if state.released.contains(&scope) {
            return Err(VaultError::AlreadyReleased {
                order_id: order_id.to_string(),
                segment_id,
            });
        }
        if !state.verified.contains(&scope) {
            return Err(VaultError::NotVerified {
                order_id: order_id.to_string(),
                segment_id,
            });
        }
        let secret = *state
            .secrets
            .get(&scope)
            .ok_or_else(|| VaultError::UnknownSecret {
                order_id: order_id.to_string(),
                segment_id,
            })?;

        // Log first, return second: a crash in between loses the
        // secret, never double-releases it.
        state.released.insert(scope);
        state.log.push(SecretRelease {
            order_id: order_id.to_string(),
            segment_id,
            released_to: released_to.to_string(),
            released_at: Utc::now(),
        });
        info!(order_id, ?segment_id, released_to, "secret released");
        Ok(secret)
    }

    /// Whether a secret is held for the scope.
    pub async fn has_secret(&self, order_id: &str, segment_id: Option<u8>) -> bool {
        let state = self.state.lock().await;
        state
            .secrets
            .contains_key(&(order_id.to_string(), segment_id))
    }

    /// Snapshot of the release log.
    pub async fn release_log(&self) -> Vec<SecretRelease> {
        self.state.lock().await.log.clone()
    }
}

impl Default for SecretVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashlock::mint_single;

    #[tokio::test]
    async fn test_release_requires_verification() {
        let vault = SecretVault::new();
        let (secret, _) = mint_single();
        vault.store_single("ord-1", secret).await;

        let err = vault.release("ord-1", None, "res-a").await.unwrap_err();
        assert!(matches!(err, VaultError::NotVerified { .. }));

        vault.mark_verified("ord-1", None).await;
        let released = vault.release("ord-1", None, "res-a").await.unwrap();
        assert_eq!(released, secret);
    }

    #[tokio::test]
    async fn test_at_most_once_release() {
        let vault = SecretVault::new();
        let (secret, _) = mint_single();
        vault.store_single("ord-1", secret).await;
        vault.mark_verified("ord-1", None).await;

        vault.release("ord-1", None, "res-a").await.unwrap();
        let err = vault.release("ord-1", None, "res-b").await.unwrap_err();
        assert!(matches!(err, VaultError::AlreadyReleased { .. }));

        let log = vault.release_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].released_to, "res-a");
    }

    #[tokio::test]
    async fn test_segment_scopes_are_independent() {
        let vault = SecretVault::new();
        let secrets: Vec<_> = (0..4).map(|_| hashlock::mint_secret()).collect();
        vault.store_segmented("ord-1", &secrets).await;

        vault.mark_verified("ord-1", Some(1)).await;
        vault.mark_verified("ord-1", Some(3)).await;

        assert_eq!(
            vault.release("ord-1", Some(1), "res-a").await.unwrap(),
            secrets[0]
        );
        assert_eq!(
            vault.release("ord-1", Some(3), "res-b").await.unwrap(),
            secrets[2]
        );
        assert!(matches!(
            vault.release("ord-1", Some(2), "res-a").await,
            Err(VaultError::NotVerified { .. })
        ));
        assert!(matches!(
            vault.release("ord-1", Some(1), "res-a").await,
            Err(VaultError::AlreadyReleased { .. })
        ));
    }

    #[tokio::test]
    async fn test_registration_validates_hashlock() {
        let vault = SecretVault::new();
        let (secret, hash) = mint_single();
        assert!(vault.register_single("ord-1", secret, &hash).await.is_ok());

        let mut wrong = secret;
        wrong[0] ^= 1;
        assert!(matches!(
            vault.register_single("ord-2", wrong, &hash).await,
            Err(VaultError::HashMismatch { .. })
        ));
    }
}
