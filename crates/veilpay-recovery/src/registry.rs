use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info};

use veilpay_core::constants::{
    MIN_LIQUIDITY_LAMPORTS, OWNER_RATE_LIMIT_MAX, OWNER_RATE_WINDOW_SECS, RESERVATION_TTL_SECS,
};
use veilpay_core::types::{now_ms, Address, Lamports, SessionId};
use veilpay_core::GatewayError;
use veilpay_ledger::{InstructionKind, LedgerClient, LedgerTransaction};
use veilpay_state::DocumentStore;
use veilpay_vault::{encrypt_secret, fresh_salt, Signer};

use crate::pool::{RecoveryPool, RecoveryStatus};

// ── Per-owner book ───────────────────────────────────────────────────────────

/// Reservation and rate state for one owner. Guarded by the owner's mutex so
/// no two tasks compute `available` at the same time.
#[derive(Default)]
struct OwnerBook {
    /// session_id → (lamports held, when the hold was taken).
    pending: HashMap<SessionId, (Lamports, Instant)>,
    /// Instants of recent settlement-bearing operations.
    recent_ops: VecDeque<Instant>,
}

impl OwnerBook {
    fn prune(&mut self, now: Instant) {
        self.pending
            .retain(|_, (_, at)| now.duration_since(*at).as_secs() < RESERVATION_TTL_SECS);
        while let Some(front) = self.recent_ops.front() {
            if now.duration_since(*front).as_secs() >= OWNER_RATE_WINDOW_SECS {
                self.recent_ops.pop_front();
            } else {
                break;
            }
        }
    }

    fn pending_total(&self) -> Lamports {
        self.pending.values().map(|(amount, _)| *amount).sum()
    }
}

// ── RecoveryRegistry ─────────────────────────────────────────────────────────

/// Registry of recovery pools plus the liquidity reservation ledger.
pub struct RecoveryRegistry {
    store: Arc<DocumentStore<RecoveryPool>>,
    ledger: Arc<LedgerClient>,
    signers: Mutex<HashMap<Address, Arc<Signer>>>,
    books: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<OwnerBook>>>>,
}

impl RecoveryRegistry {
    pub fn new(store: Arc<DocumentStore<RecoveryPool>>, ledger: Arc<LedgerClient>) -> Self {
        // Signer cache starts empty: persisted pools come back locked.
        store.modify(|records| {
            for pool in records.values_mut() {
                if pool.status == RecoveryStatus::Active {
                    pool.status = RecoveryStatus::Locked;
                }
            }
        });
        Self {
            store,
            ledger,
            signers: Mutex::new(HashMap::new()),
            books: Mutex::new(HashMap::new()),
        }
    }

    fn book(&self, owner: &Address) -> Arc<tokio::sync::Mutex<OwnerBook>> {
        Arc::clone(
            self.books
                .lock()
                .expect("book map poisoned")
                .entry(*owner)
                .or_default(),
        )
    }

    // ── Creation & resolution ────────────────────────────────────────────────

    /// Create the owner's recovery pool and an unsigned funding transaction
    /// (fee payer = owner) for the caller to sign and submit.
    pub async fn create(
        &self,
        owner: &Address,
        owner_sig: &[u8],
        fund_lamports: Lamports,
    ) -> Result<(RecoveryPool, LedgerTransaction), GatewayError> {
        if self.store.contains(&owner.to_b58()) {
            return Err(GatewayError::RecoveryPoolExists(owner.to_b58()));
        }

        let signer = Signer::generate();
        let salt = fresh_salt();
        let sealed = encrypt_secret(signer.secret_bytes().as_slice(), owner, owner_sig, &salt)?;

        let pool = RecoveryPool {
            owner_address: *owner,
            public_key: signer.address(),
            encrypted_secret_key: sealed,
            encryption_salt: salt,
            total_recycled: 0,
            created_at: now_ms(),
            status: RecoveryStatus::Created,
        };
        self.store.insert(owner.to_b58(), pool.clone());
        self.signers
            .lock()
            .expect("signer cache poisoned")
            .insert(*owner, Arc::new(signer));

        let recent = self.ledger.latest_blockhash().await?;
        let funding = LedgerTransaction::new(
            *owner,
            recent.blockhash,
            recent.last_valid_block_height,
            vec![InstructionKind::SystemTransfer {
                from: *owner,
                to: pool.public_key,
                lamports: fund_lamports,
            }],
        );
        info!(owner = %owner, recovery = %pool.public_key, "recovery pool created");
        Ok((pool, funding))
    }

    pub fn get(&self, owner: &Address) -> Result<RecoveryPool, GatewayError> {
        self.store
            .get(&owner.to_b58())
            .ok_or_else(|| GatewayError::RecoveryPoolNotFound(owner.to_b58()))
    }

    /// Decrypt the recovery signer with a fresh owner signature.
    pub fn unlock(&self, owner: &Address, owner_sig: &[u8]) -> Result<Arc<Signer>, GatewayError> {
        if let Some(cached) = self.signers.lock().expect("signer cache poisoned").get(owner) {
            return Ok(Arc::clone(cached));
        }
        let pool = self.get(owner)?;
        let plain =
            pool.encrypted_secret_key
                .decrypt_with(owner, owner_sig, &pool.encryption_salt)?;
        let signer = Signer::from_secret_bytes(plain.as_slice())?;
        if signer.address() != pool.public_key {
            return Err(GatewayError::MismatchedKey(owner.to_b58()));
        }
        let signer = Arc::new(signer);
        self.signers
            .lock()
            .expect("signer cache poisoned")
            .insert(*owner, Arc::clone(&signer));
        self.set_status(owner, RecoveryStatus::Active)?;
        Ok(signer)
    }

    fn set_status(&self, owner: &Address, status: RecoveryStatus) -> Result<(), GatewayError> {
        self.store.modify(|records| match records.get_mut(&owner.to_b58()) {
            Some(pool) => {
                pool.status = status;
                Ok(())
            }
            None => Err(GatewayError::RecoveryPoolNotFound(owner.to_b58())),
        })
    }

    // ── Liquidity reservations ───────────────────────────────────────────────

    /// Take a soft hold of `amount` lamports for `session_id`. The owner
    /// mutex serializes the balance read and the decision; the hold expires
    /// on its own after 60 s if never released.
    pub async fn reserve(
        &self,
        owner: &Address,
        amount: Lamports,
        session_id: &SessionId,
    ) -> Result<(), GatewayError> {
        let pool = self.get(owner)?;
        let book = self.book(owner);
        let mut book = book.lock().await;

        let balance = self.ledger.get_balance(&pool.public_key).await?;
        let now = Instant::now();
        book.prune(now);

        let committed = book.pending_total();
        let available = balance
            .saturating_sub(committed)
            .saturating_sub(MIN_LIQUIDITY_LAMPORTS);
        if available < amount {
            debug!(owner = %owner, amount, available, "reservation refused");
            return Err(GatewayError::InsufficientLiquidity {
                needed: amount,
                available,
            });
        }
        book.pending.insert(session_id.clone(), (amount, now));
        debug!(owner = %owner, session = %session_id, amount, "reserved");
        Ok(())
    }

    /// Drop a hold. Safe to call for already-released or expired holds.
    pub async fn release(&self, owner: &Address, session_id: &SessionId) {
        let book = self.book(owner);
        let mut book = book.lock().await;
        book.pending.remove(session_id);
        book.prune(Instant::now());
    }

    /// Admit at most five settlement-bearing operations per owner per
    /// rolling minute. Admission is recorded on success.
    pub async fn rate_check(&self, owner: &Address) -> Result<(), GatewayError> {
        let book = self.book(owner);
        let mut book = book.lock().await;
        let now = Instant::now();
        book.prune(now);

        if book.recent_ops.len() >= OWNER_RATE_LIMIT_MAX {
            let oldest = *book.recent_ops.front().expect("non-empty window");
            let retry_after_secs = OWNER_RATE_WINDOW_SECS
                .saturating_sub(now.duration_since(oldest).as_secs())
                .max(1);
            return Err(GatewayError::RateLimited { retry_after_secs });
        }
        book.recent_ops.push_back(now);
        Ok(())
    }

    // ── Rent recycling ───────────────────────────────────────────────────────

    /// Credit lamports recovered from a closed ephemeral account.
    pub fn credit_recycled(&self, owner: &Address, lamports: Lamports) -> Result<(), GatewayError> {
        self.store.modify(|records| match records.get_mut(&owner.to_b58()) {
            Some(pool) => {
                pool.total_recycled += lamports;
                Ok(())
            }
            None => Err(GatewayError::RecoveryPoolNotFound(owner.to_b58())),
        })?;
        info!(owner = %owner, lamports, "rent recycled");
        Ok(())
    }
}
