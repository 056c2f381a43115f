use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use veilpay_core::types::{now_ms, Address, PoolId};
use veilpay_core::GatewayError;
use veilpay_state::DocumentStore;
use veilpay_vault::{encrypt_secret, fresh_salt, Signer};

use crate::pool::{PoolStatus, PoolType, StealthPool};

/// Check one funding edge against the hierarchy: ROOT funds INTERMEDIATE,
/// INTERMEDIATE funds LEAF, nothing else.
pub fn validate_funding_edge(src: PoolType, dst: PoolType) -> Result<(), GatewayError> {
    match (src, dst) {
        (PoolType::Root, PoolType::Intermediate) | (PoolType::Intermediate, PoolType::Leaf) => {
            Ok(())
        }
        _ => Err(GatewayError::HierarchyViolation {
            src: format!("{src:?}").to_lowercase(),
            dst: format!("{dst:?}").to_lowercase(),
        }),
    }
}

/// Registry of stealth pools. Ciphertext persists in the pools document;
/// decrypted signers live only in the in-memory cache, which starts empty
/// on every process start.
pub struct PoolRegistry {
    store: Arc<DocumentStore<StealthPool>>,
    signers: Mutex<HashMap<PoolId, Arc<Signer>>>,
    /// One in-flight payment per source pool; the orchestrator holds the
    /// guard from its preconditions through Phase 4.
    guards: Mutex<HashMap<PoolId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PoolRegistry {
    /// Wrap the persisted document. Pools that were usable before the
    /// restart come back locked until their owner re-authenticates.
    pub fn new(store: Arc<DocumentStore<StealthPool>>) -> Self {
        let registry = Self {
            store,
            signers: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        };
        registry.lock_all();
        registry
    }

    fn lock_all(&self) {
        let relocked = self.store.modify(|records| {
            let mut n = 0;
            for pool in records.values_mut() {
                if matches!(pool.status, PoolStatus::Funded | PoolStatus::Active) {
                    pool.status = PoolStatus::Locked;
                    n += 1;
                }
            }
            n
        });
        if relocked > 0 {
            info!(relocked, "pools locked pending re-authentication");
        }
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    /// Create a pool for `owner`. ROOT pools are unique per owner; child
    /// pools must name a parent of the right type owned by the same owner.
    pub fn create_pool(
        &self,
        owner: &Address,
        owner_sig: &[u8],
        pool_type: PoolType,
        funded_from: Option<PoolId>,
    ) -> Result<StealthPool, GatewayError> {
        match pool_type {
            PoolType::Root => {
                if self.root_of(owner).is_some() {
                    return Err(GatewayError::RootAlreadyExists(owner.to_b58()));
                }
            }
            _ => {
                let parent_id = funded_from
                    .as_ref()
                    .ok_or_else(|| GatewayError::HierarchyViolation {
                        src: "none".into(),
                        dst: format!("{pool_type:?}").to_lowercase(),
                    })?;
                let parent = self.get(parent_id)?;
                if parent.owner_address != *owner {
                    return Err(GatewayError::ForeignPool {
                        pool: parent_id.to_string(),
                        owner: owner.to_b58(),
                    });
                }
                validate_funding_edge(parent.pool_type, pool_type)?;
            }
        }

        let signer = Signer::generate();
        let salt = fresh_salt();
        let sealed = encrypt_secret(signer.secret_bytes().as_slice(), owner, owner_sig, &salt)?;

        let pool = StealthPool {
            pool_id: PoolId::generate(),
            owner_address: *owner,
            public_key: signer.address(),
            encrypted_secret_key: sealed,
            encryption_salt: salt,
            creation_signature: hex::encode(owner_sig),
            pool_type,
            funded_from,
            created_at: now_ms(),
            status: PoolStatus::Created,
        };

        self.store
            .insert(pool.pool_id.to_string(), pool.clone());
        self.signers
            .lock()
            .expect("signer cache poisoned")
            .insert(pool.pool_id.clone(), Arc::new(signer));
        info!(pool_id = %pool.pool_id, pool_type = ?pool.pool_type, "pool created");
        Ok(pool)
    }

    // ── Resolution ───────────────────────────────────────────────────────────

    pub fn get(&self, pool_id: &PoolId) -> Result<StealthPool, GatewayError> {
        self.store
            .get(pool_id.as_str())
            .ok_or_else(|| GatewayError::PoolNotFound(pool_id.to_string()))
    }

    /// Decrypt the pool's secret with a fresh owner signature and cache the
    /// signer. A derived public key that disagrees with the persisted one is
    /// treated as ciphertext corruption.
    pub fn unlock(&self, pool_id: &PoolId, owner_sig: &[u8]) -> Result<Arc<Signer>, GatewayError> {
        if let Some(cached) = self
            .signers
            .lock()
            .expect("signer cache poisoned")
            .get(pool_id)
        {
            return Ok(Arc::clone(cached));
        }

        let pool = self.get(pool_id)?;
        let plain = pool.encrypted_secret_key.decrypt_with(
            &pool.owner_address,
            owner_sig,
            &pool.encryption_salt,
        )?;
        let signer = Signer::from_secret_bytes(plain.as_slice())?;
        if signer.address() != pool.public_key {
            warn!(pool_id = %pool_id, "decrypted key disagrees with persisted public key");
            return Err(GatewayError::MismatchedKey(pool_id.to_string()));
        }

        let signer = Arc::new(signer);
        self.signers
            .lock()
            .expect("signer cache poisoned")
            .insert(pool_id.clone(), Arc::clone(&signer));
        if pool.status == PoolStatus::Locked {
            self.set_status(pool_id, PoolStatus::Funded)?;
        }
        info!(pool_id = %pool_id, "pool unlocked");
        Ok(signer)
    }

    /// Cached signer only; never touches ciphertext.
    pub fn signer(&self, pool_id: &PoolId) -> Result<Arc<Signer>, GatewayError> {
        self.signers
            .lock()
            .expect("signer cache poisoned")
            .get(pool_id)
            .cloned()
            .ok_or_else(|| GatewayError::PoolLocked(pool_id.to_string()))
    }

    // ── Hierarchy queries ────────────────────────────────────────────────────

    pub fn children_of(&self, pool_id: &PoolId) -> Vec<StealthPool> {
        self.store
            .all()
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.funded_from.as_ref() == Some(pool_id))
            .collect()
    }

    pub fn root_of(&self, owner: &Address) -> Option<StealthPool> {
        self.store
            .all()
            .into_iter()
            .map(|(_, p)| p)
            .find(|p| p.owner_address == *owner && p.pool_type == PoolType::Root)
    }

    pub fn pools_of(&self, owner: &Address) -> Vec<StealthPool> {
        self.store
            .all()
            .into_iter()
            .map(|(_, p)| p)
            .filter(|p| p.owner_address == *owner)
            .collect()
    }

    // ── Status transitions ───────────────────────────────────────────────────

    fn set_status(&self, pool_id: &PoolId, status: PoolStatus) -> Result<(), GatewayError> {
        self.store.modify(|records| {
            match records.get_mut(pool_id.as_str()) {
                Some(pool) => {
                    pool.status = status;
                    Ok(())
                }
                None => Err(GatewayError::PoolNotFound(pool_id.to_string())),
            }
        })
    }

    pub fn mark_funded(&self, pool_id: &PoolId) -> Result<(), GatewayError> {
        self.set_status(pool_id, PoolStatus::Funded)
    }

    pub fn mark_active(&self, pool_id: &PoolId) -> Result<(), GatewayError> {
        self.set_status(pool_id, PoolStatus::Active)
    }

    // ── Per-pool in-flight guard ─────────────────────────────────────────────

    pub fn pool_guard(&self, pool_id: &PoolId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.guards
                .lock()
                .expect("guard map poisoned")
                .entry(pool_id.clone())
                .or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (PoolRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::load(dir.path().join("pools.json")).unwrap();
        (PoolRegistry::new(store), dir)
    }

    fn owner_keys() -> (Signer, Address) {
        let s = Signer::generate();
        let a = s.address();
        (s, a)
    }

    #[tokio::test]
    async fn one_root_per_owner() {
        let (reg, _dir) = registry();
        let (_, owner) = owner_keys();
        reg.create_pool(&owner, b"sig", PoolType::Root, None).unwrap();
        let err = reg
            .create_pool(&owner, b"sig", PoolType::Root, None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::RootAlreadyExists(_)));
    }

    #[tokio::test]
    async fn hierarchy_edges() {
        assert!(validate_funding_edge(PoolType::Root, PoolType::Intermediate).is_ok());
        assert!(validate_funding_edge(PoolType::Intermediate, PoolType::Leaf).is_ok());
        for (src, dst) in [
            (PoolType::Root, PoolType::Leaf),
            (PoolType::Leaf, PoolType::Leaf),
            (PoolType::Intermediate, PoolType::Intermediate),
            (PoolType::Leaf, PoolType::Root),
        ] {
            assert!(validate_funding_edge(src, dst).is_err());
        }
    }

    #[tokio::test]
    async fn child_creation_validates_edge_and_owner() {
        let (reg, _dir) = registry();
        let (_, owner) = owner_keys();
        let root = reg.create_pool(&owner, b"sig", PoolType::Root, None).unwrap();

        // ROOT -> LEAF refused.
        let err = reg
            .create_pool(&owner, b"sig", PoolType::Leaf, Some(root.pool_id.clone()))
            .unwrap_err();
        assert!(matches!(err, GatewayError::HierarchyViolation { .. }));

        // Foreign parent refused.
        let (_, other) = owner_keys();
        let err = reg
            .create_pool(&other, b"sig", PoolType::Intermediate, Some(root.pool_id.clone()))
            .unwrap_err();
        assert!(matches!(err, GatewayError::ForeignPool { .. }));

        let mid = reg
            .create_pool(&owner, b"sig", PoolType::Intermediate, Some(root.pool_id.clone()))
            .unwrap();
        assert_eq!(reg.children_of(&root.pool_id).len(), 1);
        assert_eq!(reg.children_of(&mid.pool_id).len(), 0);
    }

    #[tokio::test]
    async fn unlock_requires_the_creating_signature() {
        let (reg, _dir) = registry();
        let (_, owner) = owner_keys();
        let pool = reg.create_pool(&owner, b"right", PoolType::Root, None).unwrap();

        // Drop the cached signer to force the ciphertext path.
        reg.signers.lock().unwrap().clear();
        assert!(matches!(
            reg.signer(&pool.pool_id).unwrap_err(),
            GatewayError::PoolLocked(_)
        ));

        let err = reg.unlock(&pool.pool_id, b"wrong").unwrap_err();
        assert!(matches!(err, GatewayError::KeyVaultAuthFailed));

        let signer = reg.unlock(&pool.pool_id, b"right").unwrap();
        assert_eq!(signer.address(), pool.public_key);
    }

    #[tokio::test]
    async fn corrupted_public_key_is_detected() {
        let (reg, _dir) = registry();
        let (_, owner) = owner_keys();
        let pool = reg.create_pool(&owner, b"sig", PoolType::Root, None).unwrap();

        reg.signers.lock().unwrap().clear();
        reg.store.modify(|records| {
            records.get_mut(pool.pool_id.as_str()).unwrap().public_key =
                Address::from_bytes([0xAB; 32]);
        });

        let err = reg.unlock(&pool.pool_id, b"sig").unwrap_err();
        assert!(matches!(err, GatewayError::MismatchedKey(_)));
    }

    #[tokio::test]
    async fn restart_relocks_usable_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pools.json");
        let (_, owner) = owner_keys();

        let pool_id = {
            let store = DocumentStore::load(&path).unwrap();
            let reg = PoolRegistry::new(store);
            let pool = reg.create_pool(&owner, b"sig", PoolType::Root, None).unwrap();
            reg.mark_active(&pool.pool_id).unwrap();
            reg.store.flush_now().unwrap();
            pool.pool_id
        };

        let store = DocumentStore::load(&path).unwrap();
        let reg = PoolRegistry::new(store);
        assert_eq!(reg.get(&pool_id).unwrap().status, PoolStatus::Locked);
        assert!(matches!(
            reg.signer(&pool_id).unwrap_err(),
            GatewayError::PoolLocked(_)
        ));
    }
}
