use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use veilpay_core::types::Address;
use veilpay_core::GatewayError;

const IV_LEN: usize = 12;

/// Derive the 256-bit AEAD key from `owner ‖ owner_signature ‖ salt`.
fn derive_key(owner: &Address, owner_sig: &[u8], salt: &str) -> Zeroizing<[u8; 32]> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(owner.as_bytes());
    hasher.update(owner_sig);
    hasher.update(salt.as_bytes());
    Zeroizing::new(*hasher.finalize().as_bytes())
}

/// Fresh random salt, 16 bytes hex-encoded.
pub fn fresh_salt() -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    hex::encode(b)
}

// ── SealedKey ────────────────────────────────────────────────────────────────

/// A signing secret at rest: `base64(IV ‖ ciphertext ‖ auth_tag)`.
///
/// Opaque by construction: the only way back to plaintext is
/// [`SealedKey::decrypt_with`] holding the same owner material that sealed it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedKey(String);

impl SealedKey {
    /// Decrypt with the original `(owner, owner_signature, salt)` triple.
    /// Authentication failure yields no plaintext.
    pub fn decrypt_with(
        &self,
        owner: &Address,
        owner_sig: &[u8],
        salt: &str,
    ) -> Result<Zeroizing<Vec<u8>>, GatewayError> {
        let blob = B64
            .decode(&self.0)
            .map_err(|_| GatewayError::KeyVaultAuthFailed)?;
        if blob.len() <= IV_LEN {
            return Err(GatewayError::KeyVaultAuthFailed);
        }
        let key = derive_key(owner, owner_sig, salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let nonce = Nonce::from_slice(&blob[..IV_LEN]);
        let plain = cipher
            .decrypt(nonce, &blob[IV_LEN..])
            .map_err(|_| GatewayError::KeyVaultAuthFailed)?;
        Ok(Zeroizing::new(plain))
    }
}

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedKey({}b)", self.0.len())
    }
}

/// Seal a signing secret under the owner material. Random 12-byte IV per
/// call; output is `base64(IV ‖ ciphertext ‖ auth_tag)`.
pub fn encrypt_secret(
    secret: &[u8],
    owner: &Address,
    owner_sig: &[u8],
    salt: &str,
) -> Result<SealedKey, GatewayError> {
    let key = derive_key(owner, owner_sig, salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), secret)
        .map_err(|_| GatewayError::Serialization("aead encrypt".into()))?;

    let mut blob = Vec::with_capacity(IV_LEN + ct.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ct);
    Ok(SealedKey(B64.encode(blob)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Signer;

    fn owner() -> Address {
        Address::from_bytes([11u8; 32])
    }

    #[test]
    fn seal_round_trip() {
        let secret = Signer::generate().secret_bytes();
        let salt = fresh_salt();
        let sealed = encrypt_secret(secret.as_slice(), &owner(), b"sig-material", &salt).unwrap();
        let plain = sealed.decrypt_with(&owner(), b"sig-material", &salt).unwrap();
        assert_eq!(plain.as_slice(), secret.as_slice());
    }

    #[test]
    fn wrong_signature_authenticates_nothing() {
        let secret = Signer::generate().secret_bytes();
        let salt = fresh_salt();
        let sealed = encrypt_secret(secret.as_slice(), &owner(), b"right", &salt).unwrap();
        let err = sealed.decrypt_with(&owner(), b"wrong", &salt).unwrap_err();
        assert!(matches!(err, GatewayError::KeyVaultAuthFailed));
    }

    #[test]
    fn wrong_salt_or_owner_fails() {
        let secret = Signer::generate().secret_bytes();
        let salt = fresh_salt();
        let sealed = encrypt_secret(secret.as_slice(), &owner(), b"sig", &salt).unwrap();
        assert!(sealed.decrypt_with(&owner(), b"sig", &fresh_salt()).is_err());
        assert!(sealed
            .decrypt_with(&Address::from_bytes([12u8; 32]), b"sig", &salt)
            .is_err());
    }

    #[test]
    fn distinct_ivs_per_seal() {
        let secret = [5u8; 64];
        let salt = fresh_salt();
        let a = encrypt_secret(&secret, &owner(), b"sig", &salt).unwrap();
        let b = encrypt_secret(&secret, &owner(), b"sig", &salt).unwrap();
        assert_ne!(a, b);
    }
}
