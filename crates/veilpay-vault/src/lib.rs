//! veilpay-vault
//!
//! Key custody for the gateway: ed25519 signers whose secrets are zeroized
//! on drop, and authenticated encryption of 64-byte signing secrets at rest,
//! keyed from `(owner_address, owner_signature, salt)`.
//!
//! Nothing in this crate persists or logs plaintext key material.

pub mod sealed;
pub mod signer;

pub use sealed::{encrypt_secret, fresh_salt, SealedKey};
pub use signer::{verify_owner_signature, Signer};
