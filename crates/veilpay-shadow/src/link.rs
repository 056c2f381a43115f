use serde::{Deserialize, Serialize};

use veilpay_core::types::{Address, LinkId, TimestampMs, TokenAmount, TxSignature};
use veilpay_vault::SealedKey;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Live invoice awaiting funds at the stealth address.
    Waiting,
    /// Funds detected (or owner-confirmed); sweep outstanding.
    Paid,
    /// Swept into the destination pool. Terminal; secret purged.
    Swept,
    Expired,
    Cancelled,
}

impl LinkStatus {
    /// Terminal states release the alias once the retention window passes.
    /// `Paid` is not terminal: its sweep is still outstanding.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkStatus::Swept | LinkStatus::Expired | LinkStatus::Cancelled
        )
    }
}

/// A one-time invoice. The stealth secret stays sealed; after a sweep the
/// ciphertext remains for audit but no operation decrypts it again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShadowLink {
    pub link_id: LinkId,
    /// Human-memorable handle, unique among non-terminal links.
    pub alias: String,
    /// The ephemeral public key payers deposit to.
    pub stealth_address: Address,
    pub encrypted_secret_key: SealedKey,
    pub encryption_salt: String,
    pub owner_address: Address,
    pub destination_pool_address: Address,
    pub expected_amount: TokenAmount,
    /// Optional memo, sealed under the same owner material.
    pub memo: Option<SealedKey>,
    pub expires_at: TimestampMs,
    pub status: LinkStatus,
    pub payment_tx: Option<TxSignature>,
    pub sweep_tx: Option<TxSignature>,
    pub paid_from: Option<Address>,
    pub created_at: TimestampMs,
    /// When the link reached a terminal state; starts the alias retention
    /// clock.
    pub terminal_at: Option<TimestampMs>,
}
