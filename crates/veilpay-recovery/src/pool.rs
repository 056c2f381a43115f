use serde::{Deserialize, Serialize};

use veilpay_core::types::{Address, Lamports, TimestampMs};
use veilpay_vault::SealedKey;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Registered; funding transaction not yet observed.
    Created,
    Active,
    /// Key not in memory; re-authentication required to sign sweeps.
    Locked,
}

/// The per-owner fee payer. Its public key must never appear as the payer
/// of record on a settlement transfer to a recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryPool {
    pub owner_address: Address,
    pub public_key: Address,
    pub encrypted_secret_key: SealedKey,
    pub encryption_salt: String,
    /// Cumulative lamports returned from closed ephemeral accounts.
    pub total_recycled: Lamports,
    pub created_at: TimestampMs,
    pub status: RecoveryStatus,
}
