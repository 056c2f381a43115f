//! veilpay-audit
//!
//! Append-only, per-owner encrypted trail of payment sessions. Each entry
//! keeps a small clear-metadata header; the full session is sealed with the
//! same AEAD primitive as the key vault. Plaintext leaves this crate only
//! through an attested decryption: a fresh owner signature over a
//! nonce+timestamp challenge.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use veilpay_core::constants::{AUDIT_LOG_CAP, CHALLENGE_TTL_SECS};
use veilpay_core::types::{now_ms, Address, SessionId, TimestampMs};
use veilpay_core::{GatewayError, PaymentMethod, PaymentSession};
use veilpay_vault::{encrypt_secret, fresh_salt, verify_owner_signature, SealedKey};

// ── Entries ──────────────────────────────────────────────────────────────────

struct AuditEntry {
    meta: AuditMeta,
    salt: String,
    sealed: SealedKey,
}

/// The non-sensitive header stored (and listed) in clear.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditMeta {
    pub session_id: SessionId,
    pub status: String,
    pub method: PaymentMethod,
    pub tx_count: usize,
    pub created_at: TimestampMs,
}

// ── Challenges ───────────────────────────────────────────────────────────────

/// A one-shot decryption challenge: sign `message()` to attest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: String,
    pub issued_at_ms: TimestampMs,
}

impl Challenge {
    fn fresh() -> Self {
        let mut b = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut b);
        Self {
            nonce: hex::encode(b),
            issued_at_ms: now_ms(),
        }
    }

    /// The exact bytes the owner must sign.
    pub fn message(&self) -> Vec<u8> {
        format!("veilpay-audit:{}:{}", self.nonce, self.issued_at_ms).into_bytes()
    }

    fn expired(&self, now: TimestampMs) -> bool {
        now - self.issued_at_ms > (CHALLENGE_TTL_SECS as i64) * 1_000
    }
}

// ── AuditLogger ──────────────────────────────────────────────────────────────

pub struct AuditLogger {
    logs: Mutex<HashMap<Address, VecDeque<AuditEntry>>>,
    challenges: Mutex<HashMap<Address, Challenge>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(HashMap::new()),
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Seal a terminal session into the owner's log. The plaintext copy
    /// held by the caller should be dropped after this returns.
    pub fn seal(
        &self,
        owner: &Address,
        owner_sig: &[u8],
        session: &PaymentSession,
    ) -> Result<(), GatewayError> {
        let salt = fresh_salt();
        let plaintext =
            bincode::serialize(session).map_err(|e| GatewayError::Serialization(e.to_string()))?;
        let sealed = encrypt_secret(&plaintext, owner, owner_sig, &salt)?;

        let entry = AuditEntry {
            meta: AuditMeta {
                session_id: session.session_id.clone(),
                status: session.status.label(),
                method: session.method,
                tx_count: session.transactions.len(),
                created_at: session.created_at,
            },
            salt,
            sealed,
        };

        let mut logs = self.logs.lock().expect("audit log poisoned");
        let log = logs.entry(*owner).or_default();
        log.push_back(entry);
        while log.len() > AUDIT_LOG_CAP {
            log.pop_front();
        }
        debug!(owner = %owner, session = %session.session_id, "session sealed");
        Ok(())
    }

    /// Clear metadata only; ciphertext stays put.
    pub fn entries(&self, owner: &Address) -> Vec<AuditMeta> {
        self.logs
            .lock()
            .expect("audit log poisoned")
            .get(owner)
            .map(|log| log.iter().map(|e| e.meta.clone()).collect())
            .unwrap_or_default()
    }

    /// Issue (and remember) a fresh challenge for the owner. Supersedes any
    /// outstanding one.
    pub fn issue_challenge(&self, owner: &Address) -> Challenge {
        let challenge = Challenge::fresh();
        self.challenges
            .lock()
            .expect("challenge map poisoned")
            .insert(*owner, challenge.clone());
        challenge
    }

    /// Decrypt the owner's sealed sessions. `attestation` must be the
    /// owner's signature over the outstanding challenge; `owner_sig` is the
    /// key material the sessions were sealed under.
    pub fn decrypt_batch(
        &self,
        owner: &Address,
        attestation: &[u8],
        owner_sig: &[u8],
    ) -> Result<Vec<PaymentSession>, GatewayError> {
        let challenge = {
            let mut challenges = self.challenges.lock().expect("challenge map poisoned");
            let challenge = challenges
                .get(owner)
                .cloned()
                .ok_or(GatewayError::ChallengeExpired)?;
            if challenge.expired(now_ms()) {
                challenges.remove(owner);
                return Err(GatewayError::ChallengeExpired);
            }
            challenge
        };

        if !verify_owner_signature(owner, &challenge.message(), attestation) {
            warn!(owner = %owner, "audit attestation failed");
            return Err(GatewayError::AttestationFailed);
        }
        // One signature, one batch.
        self.challenges
            .lock()
            .expect("challenge map poisoned")
            .remove(owner);

        let logs = self.logs.lock().expect("audit log poisoned");
        let Some(log) = logs.get(owner) else {
            return Ok(Vec::new());
        };
        log.iter()
            .map(|entry| {
                let plain = entry.sealed.decrypt_with(owner, owner_sig, &entry.salt)?;
                bincode::deserialize(&plain)
                    .map_err(|e| GatewayError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilpay_core::SessionStatus;
    use veilpay_vault::Signer;

    fn session(owner: Address) -> PaymentSession {
        let mut s = PaymentSession::new(
            owner,
            Address::from_bytes([2; 32]),
            Address::from_bytes([3; 32]),
            Address::from_bytes([4; 32]),
            70_000,
            PaymentMethod::Gasless,
        );
        s.finish(SessionStatus::Completed);
        s
    }

    #[test]
    fn attested_round_trip() {
        let owner_key = Signer::generate();
        let owner = owner_key.address();
        let log = AuditLogger::new();

        log.seal(&owner, b"seal-material", &session(owner)).unwrap();
        assert_eq!(log.entries(&owner).len(), 1);

        let challenge = log.issue_challenge(&owner);
        let attestation = owner_key.sign(&challenge.message());
        let sessions = log
            .decrypt_batch(&owner, attestation.as_bytes(), b"seal-material")
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].amount, 70_000);
    }

    #[test]
    fn bad_attestation_returns_no_plaintext() {
        let owner_key = Signer::generate();
        let intruder = Signer::generate();
        let owner = owner_key.address();
        let log = AuditLogger::new();
        log.seal(&owner, b"seal-material", &session(owner)).unwrap();

        let challenge = log.issue_challenge(&owner);
        let forged = intruder.sign(&challenge.message());
        let err = log
            .decrypt_batch(&owner, forged.as_bytes(), b"seal-material")
            .unwrap_err();
        assert!(matches!(err, GatewayError::AttestationFailed));
    }

    #[test]
    fn challenge_is_single_use() {
        let owner_key = Signer::generate();
        let owner = owner_key.address();
        let log = AuditLogger::new();
        log.seal(&owner, b"m", &session(owner)).unwrap();

        let challenge = log.issue_challenge(&owner);
        let attestation = owner_key.sign(&challenge.message());
        log.decrypt_batch(&owner, attestation.as_bytes(), b"m").unwrap();

        let err = log
            .decrypt_batch(&owner, attestation.as_bytes(), b"m")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ChallengeExpired));
    }

    #[test]
    fn log_is_bounded_and_evicts_oldest() {
        let owner_key = Signer::generate();
        let owner = owner_key.address();
        let log = AuditLogger::new();

        let mut first_id = None;
        for i in 0..(AUDIT_LOG_CAP + 3) {
            let s = session(owner);
            if i == 0 {
                first_id = Some(s.session_id.clone());
            }
            log.seal(&owner, b"m", &s).unwrap();
        }

        let entries = log.entries(&owner);
        assert_eq!(entries.len(), AUDIT_LOG_CAP);
        assert!(entries.iter().all(|m| Some(&m.session_id) != first_id.as_ref()));
    }

    #[test]
    fn metadata_exposes_no_amount_or_recipient() {
        let owner = Signer::generate().address();
        let log = AuditLogger::new();
        log.seal(&owner, b"m", &session(owner)).unwrap();
        let rendered = serde_json::to_string(&log.entries(&owner)).unwrap();
        assert!(!rendered.contains("\"amount\""));
        assert!(!rendered.contains("recipient"));
        assert!(!rendered.contains(&Address::from_bytes([4; 32]).to_b58()));
    }
}
