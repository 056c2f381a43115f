use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use veilpay_core::types::{Address, TxSignature};
use veilpay_core::GatewayError;

/// An ed25519 keypair holding signing authority over one ledger account.
///
/// The secret is wiped on drop and never appears in `Debug` output.
pub struct Signer {
    key: SigningKey,
    address: Address,
}

impl Signer {
    /// Generate a fresh keypair (pool creation, burner provisioning).
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let address = Address::from_bytes(key.verifying_key().to_bytes());
        Self { key, address }
    }

    /// Restore a signer from the 64-byte expanded form `secret ‖ public`.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        if bytes.len() != 64 {
            return Err(GatewayError::KeyVaultAuthFailed);
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let key = SigningKey::from_bytes(&seed);
        let address = Address::from_bytes(key.verifying_key().to_bytes());
        seed.fill(0);
        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(&self, message: &[u8]) -> TxSignature {
        use ed25519_dalek::Signer as _;
        TxSignature::from_bytes(self.key.sign(message).to_bytes())
    }

    /// Export the 64-byte `secret ‖ public` form for sealing at rest.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(&self.key.to_bytes());
        out[32..].copy_from_slice(self.address.as_bytes());
        out
    }
}

// SigningKey zeroizes its seed on drop (ed25519-dalek `zeroize` feature).

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signer {{ address: {:?} }}", self.address)
    }
}

/// Verify an owner's ed25519 signature over `message`. The owner address is
/// the verifying key.
pub fn verify_owner_signature(owner: &Address, message: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(owner.as_bytes()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    vk.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bytes_round_trip() {
        let s = Signer::generate();
        let restored = Signer::from_secret_bytes(s.secret_bytes().as_slice()).unwrap();
        assert_eq!(restored.address(), s.address());
    }

    #[test]
    fn signatures_verify_against_address() {
        let s = Signer::generate();
        let sig = s.sign(b"challenge");
        assert!(verify_owner_signature(&s.address(), b"challenge", sig.as_bytes()));
        assert!(!verify_owner_signature(&s.address(), b"other", sig.as_bytes()));
    }

    #[test]
    fn debug_redacts_secret() {
        let s = Signer::generate();
        let rendered = format!("{s:?}");
        assert!(rendered.contains("address"));
        assert!(!rendered.contains(&hex::encode(&s.secret_bytes()[..32])));
    }
}
