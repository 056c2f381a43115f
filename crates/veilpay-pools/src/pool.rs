use serde::{Deserialize, Serialize};

use veilpay_core::types::{Address, PoolId, TimestampMs};
use veilpay_vault::SealedKey;

/// Position of a pool in the funding hierarchy. The only legal funding
/// edges are ROOT → INTERMEDIATE and INTERMEDIATE → LEAF.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Legacy records carry a "main" tag; those read back as roots.
    #[serde(alias = "main")]
    Root,
    Intermediate,
    Leaf,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Registered, no confirmed inbound transfer yet.
    Created,
    /// First inbound transfer confirmed.
    Funded,
    /// At least one successful outbound payment.
    Active,
    /// No decrypted key in memory; cannot sign until re-authenticated.
    Locked,
}

/// A custodial ephemeral pool. The signing secret is present only as a
/// sealed ciphertext; the plaintext exists in memory strictly between a
/// successful unlock and process exit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StealthPool {
    pub pool_id: PoolId,
    pub owner_address: Address,
    /// The pool's on-chain identity.
    pub public_key: Address,
    pub encrypted_secret_key: SealedKey,
    pub encryption_salt: String,
    /// Opaque owner-signature bytes recorded at creation (hex). Part of the
    /// KDF material that sealed the key.
    pub creation_signature: String,
    pub pool_type: PoolType,
    /// Upward reference stored on the child only; downward queries scan.
    pub funded_from: Option<PoolId>,
    pub created_at: TimestampMs,
    pub status: PoolStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_main_tag_reads_as_root() {
        let ty: PoolType = serde_json::from_str("\"main\"").unwrap();
        assert_eq!(ty, PoolType::Root);
        // The legacy tag is never written back.
        assert_eq!(serde_json::to_string(&ty).unwrap(), "\"root\"");
    }
}
