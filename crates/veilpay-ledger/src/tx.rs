use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use veilpay_core::types::{Address, Lamports, TokenAmount, TxSignature};
use veilpay_core::GatewayError;
use veilpay_vault::Signer;

// ── Token account derivation ─────────────────────────────────────────────────

/// Deterministic address of the canonical token account holding `mint` for
/// `owner`.
pub fn derive_token_account(owner: &Address, mint: &Address) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"veilpay:token-account");
    hasher.update(owner.as_bytes());
    hasher.update(mint.as_bytes());
    Address::from_bytes(*hasher.finalize().as_bytes())
}

// ── Instructions ─────────────────────────────────────────────────────────────

/// The ledger primitives the gateway consumes. Each variant maps onto one
/// parsed instruction on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    /// Native lamport transfer.
    SystemTransfer {
        from: Address,
        to: Address,
        lamports: Lamports,
    },
    /// Create `owner`'s associated token account for `mint` if absent.
    /// Safe to re-submit: an existing account is a no-op, not an error.
    CreateTokenAccountIdempotent {
        payer: Address,
        owner: Address,
        mint: Address,
    },
    /// Token transfer with explicit amount and decimals.
    TokenTransferChecked {
        source: Address,
        destination: Address,
        authority: Address,
        mint: Address,
        amount: TokenAmount,
        decimals: u8,
    },
    /// Close a token account, sending its rent lamports to `destination`.
    CloseTokenAccount {
        account: Address,
        destination: Address,
        authority: Address,
    },
    ComputeUnitLimit { units: u32 },
    ComputeUnitPrice { micro_lamports: u64 },
}

impl InstructionKind {
    /// The account whose signature this instruction demands, if any.
    pub fn required_signer(&self) -> Option<Address> {
        match self {
            InstructionKind::SystemTransfer { from, .. } => Some(*from),
            InstructionKind::CreateTokenAccountIdempotent { payer, .. } => Some(*payer),
            InstructionKind::TokenTransferChecked { authority, .. } => Some(*authority),
            InstructionKind::CloseTokenAccount { authority, .. } => Some(*authority),
            InstructionKind::ComputeUnitLimit { .. } | InstructionKind::ComputeUnitPrice { .. } => {
                None
            }
        }
    }
}

// ── LedgerTransaction ────────────────────────────────────────────────────────

/// A transaction under construction or in flight. Signatures accumulate in
/// `signatures`; a partially-signed transaction can be serialized for a
/// facilitator to complete.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub fee_payer: Address,
    pub recent_blockhash: String,
    /// Block height past which this transaction is dead. Not part of the
    /// signed message; carried for confirmation bookkeeping.
    pub last_valid_block_height: u64,
    pub instructions: Vec<InstructionKind>,
    pub signatures: BTreeMap<Address, TxSignature>,
}

/// The byte content covered by every signature: everything except the
/// signatures themselves and the validity-height hint.
#[derive(Serialize)]
struct TransactionBody<'a> {
    fee_payer: &'a Address,
    recent_blockhash: &'a str,
    instructions: &'a [InstructionKind],
}

impl LedgerTransaction {
    pub fn new(
        fee_payer: Address,
        recent_blockhash: String,
        last_valid_block_height: u64,
        instructions: Vec<InstructionKind>,
    ) -> Self {
        Self {
            fee_payer,
            recent_blockhash,
            last_valid_block_height,
            instructions,
            signatures: BTreeMap::new(),
        }
    }

    /// Canonical signed-message bytes.
    pub fn message_bytes(&self) -> Vec<u8> {
        let body = TransactionBody {
            fee_payer: &self.fee_payer,
            recent_blockhash: &self.recent_blockhash,
            instructions: &self.instructions,
        };
        bincode::serialize(&body).expect("message serialization is infallible")
    }

    /// Every address whose signature the transaction needs: the fee payer
    /// plus each instruction authority.
    pub fn required_signers(&self) -> BTreeSet<Address> {
        let mut set: BTreeSet<Address> = self
            .instructions
            .iter()
            .filter_map(|ix| ix.required_signer())
            .collect();
        set.insert(self.fee_payer);
        set
    }

    /// Append `signer`'s signature over the message bytes.
    pub fn sign_with(&mut self, signer: &Signer) {
        let sig = signer.sign(&self.message_bytes());
        self.signatures.insert(signer.address(), sig);
    }

    pub fn is_fully_signed(&self) -> bool {
        self.required_signers()
            .iter()
            .all(|a| self.signatures.contains_key(a))
    }

    /// First missing required signer, for error reporting.
    pub fn missing_signer(&self) -> Option<Address> {
        self.required_signers()
            .into_iter()
            .find(|a| !self.signatures.contains_key(a))
    }

    /// The transaction's identifying signature: the fee payer's.
    pub fn signature(&self) -> Option<TxSignature> {
        self.signatures.get(&self.fee_payer).copied()
    }

    /// Wire form for submission and facilitator hand-off.
    pub fn encode_base64(&self) -> Result<String, GatewayError> {
        let bytes =
            bincode::serialize(self).map_err(|e| GatewayError::Serialization(e.to_string()))?;
        Ok(B64.encode(bytes))
    }

    pub fn decode_base64(encoded: &str) -> Result<Self, GatewayError> {
        let bytes = B64
            .decode(encoded)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| GatewayError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    #[test]
    fn token_account_derivation_is_deterministic() {
        let a = derive_token_account(&addr(1), &addr(2));
        let b = derive_token_account(&addr(1), &addr(2));
        assert_eq!(a, b);
        assert_ne!(a, derive_token_account(&addr(1), &addr(3)));
    }

    #[test]
    fn required_signers_cover_fee_payer_and_authorities() {
        let tx = LedgerTransaction::new(
            addr(9),
            "hash".into(),
            100,
            vec![
                InstructionKind::SystemTransfer {
                    from: addr(1),
                    to: addr(2),
                    lamports: 5,
                },
                InstructionKind::ComputeUnitLimit { units: 200_000 },
            ],
        );
        let signers = tx.required_signers();
        assert!(signers.contains(&addr(9)));
        assert!(signers.contains(&addr(1)));
        assert_eq!(signers.len(), 2);
    }

    #[test]
    fn partial_then_full_signing() {
        let payer = Signer::generate();
        let authority = Signer::generate();
        let mut tx = LedgerTransaction::new(
            payer.address(),
            "hash".into(),
            100,
            vec![InstructionKind::TokenTransferChecked {
                source: addr(1),
                destination: addr(2),
                authority: authority.address(),
                mint: addr(3),
                amount: 10,
                decimals: 6,
            }],
        );
        tx.sign_with(&authority);
        assert!(!tx.is_fully_signed());
        assert_eq!(tx.missing_signer(), Some(payer.address()));
        tx.sign_with(&payer);
        assert!(tx.is_fully_signed());
        assert_eq!(tx.signature(), tx.signatures.get(&payer.address()).copied());
    }

    #[test]
    fn base64_wire_round_trip_preserves_partial_signatures() {
        let burner = Signer::generate();
        let mut tx = LedgerTransaction::new(
            addr(7),
            "hash".into(),
            42,
            vec![InstructionKind::CloseTokenAccount {
                account: addr(4),
                destination: addr(5),
                authority: burner.address(),
            }],
        );
        tx.sign_with(&burner);
        let decoded = LedgerTransaction::decode_base64(&tx.encode_base64().unwrap()).unwrap();
        assert_eq!(decoded.signatures.len(), 1);
        assert_eq!(decoded.message_bytes(), tx.message_bytes());
    }
}
