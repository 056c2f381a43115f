use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use veilpay_core::constants::{PARTIAL_RETRY_INTERVAL_SECS, TOKEN_ACCOUNT_LEN};
use veilpay_core::types::{Address, Lamports};
use veilpay_core::GatewayError;
use veilpay_ledger::{derive_token_account, InstructionKind, LedgerClient, LedgerTransaction};
use veilpay_recovery::RecoveryRegistry;
use veilpay_vault::Signer;

/// Where a sweep sends what it recovers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepKind {
    /// Rollback of a failed session: everything goes to the owner's
    /// recovery pool and counts toward `total_recycled`.
    Rollback,
    /// Phase-4 retry of a `partial` session: rent and residue return to the
    /// source pool, as the original plan intended.
    RecoverRent,
}

/// One burner awaiting cleanup. Holds the live signer; burner keys never
/// touch disk.
pub struct SweepTask {
    pub kind: SweepKind,
    pub owner: Address,
    pub burner: Arc<Signer>,
    /// Source pool public key (token returns and `RecoverRent` rent).
    pub source_pool: Address,
}

/// Idempotent burner cleanup. Tasks come from failed sessions, `partial`
/// phase-4 retries, and the owner-triggered recovery sweep endpoint.
pub struct SweepQueue {
    ledger: Arc<LedgerClient>,
    recovery: Arc<RecoveryRegistry>,
    mint: Address,
    decimals: u8,
    pending: Mutex<VecDeque<SweepTask>>,
    wakeup: Notify,
    /// Most recent attempt per burner, for the retry spacing bound.
    last_attempt: Mutex<HashMap<Address, Instant>>,
}

impl SweepQueue {
    pub fn new(
        ledger: Arc<LedgerClient>,
        recovery: Arc<RecoveryRegistry>,
        mint: Address,
        decimals: u8,
    ) -> Self {
        Self {
            ledger,
            recovery,
            mint,
            decimals,
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueue(&self, task: SweepTask) {
        debug!(burner = %task.burner.address(), kind = ?task.kind, "sweep enqueued");
        self.pending.lock().expect("sweep queue poisoned").push_back(task);
        self.wakeup.notify_one();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("sweep queue poisoned").len()
    }

    fn pop(&self) -> Option<SweepTask> {
        self.pending.lock().expect("sweep queue poisoned").pop_front()
    }

    /// Background drainer: one sweep at a time, pacing retries per burner.
    pub async fn run(self: Arc<Self>) {
        loop {
            let Some(task) = self.pop() else {
                self.wakeup.notified().await;
                continue;
            };
            let burner = task.burner.address();
            if let Some(wait) = self.retry_backoff(&burner) {
                // Too soon for this burner; park the task and move on.
                let queue = Arc::clone(&self);
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    queue.enqueue(task);
                });
                continue;
            }
            match self.sweep_burner(&task).await {
                Ok(recovered) => {
                    info!(%burner, recovered, kind = ?task.kind, "burner swept");
                }
                Err(e) => {
                    warn!(%burner, "sweep failed, will retry: {e}");
                    self.enqueue(task);
                }
            }
        }
    }

    /// Owner-triggered drain: sweep every queued burner of `owner` now,
    /// ignoring the retry pacing. Returns (burners swept, lamports).
    pub async fn sweep_owner_now(&self, owner: &Address) -> (usize, Lamports) {
        let mine: Vec<SweepTask> = {
            let mut pending = self.pending.lock().expect("sweep queue poisoned");
            let (mine, rest): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|t| t.owner == *owner);
            pending.extend(rest);
            mine
        };

        let mut swept = 0;
        let mut recovered = 0;
        for task in mine {
            match self.sweep_burner(&task).await {
                Ok(lamports) => {
                    swept += 1;
                    recovered += lamports;
                }
                Err(e) => {
                    warn!(burner = %task.burner.address(), "owner sweep failed: {e}");
                    self.enqueue(task);
                }
            }
        }
        (swept, recovered)
    }

    fn retry_backoff(&self, burner: &Address) -> Option<Duration> {
        let mut attempts = self.last_attempt.lock().expect("attempt map poisoned");
        let now = Instant::now();
        match attempts.get(burner) {
            Some(last) => {
                let elapsed = now.duration_since(*last);
                let min = Duration::from_secs(PARTIAL_RETRY_INTERVAL_SECS);
                if elapsed < min {
                    Some(min - elapsed)
                } else {
                    attempts.insert(*burner, now);
                    None
                }
            }
            None => {
                attempts.insert(*burner, now);
                None
            }
        }
    }

    /// Run one Phase-4-shaped cleanup against the burner. Safe to re-invoke:
    /// an already-cleaned burner is a no-op.
    pub async fn sweep_burner(&self, task: &SweepTask) -> Result<Lamports, GatewayError> {
        let burner = task.burner.address();
        let burner_ata = derive_token_account(&burner, &self.mint);
        let rent_destination = match task.kind {
            SweepKind::Rollback => self.recovery.get(&task.owner)?.public_key,
            SweepKind::RecoverRent => task.source_pool,
        };

        let ata_exists = self.ledger.get_account_exists(&burner_ata).await?;
        let lamports = self.ledger.get_balance(&burner).await?;
        if !ata_exists && lamports == 0 {
            return Ok(0);
        }

        let fee = self.ledger.base_tx_fee().await?;
        let recent = self.ledger.latest_blockhash().await?;
        let mut instructions = Vec::new();

        if ata_exists {
            // Stranded stablecoin goes back to the source pool before the
            // account can close.
            let token_balance = self
                .ledger
                .get_token_balance(&burner, &self.mint)
                .await
                .unwrap_or(0);
            if token_balance > 0 {
                instructions.push(InstructionKind::TokenTransferChecked {
                    source: burner_ata,
                    destination: derive_token_account(&task.source_pool, &self.mint),
                    authority: burner,
                    mint: self.mint,
                    amount: token_balance,
                    decimals: self.decimals,
                });
            }
            instructions.push(InstructionKind::CloseTokenAccount {
                account: burner_ata,
                destination: rent_destination,
                authority: burner,
            });
        }

        let residual = lamports.saturating_sub(fee);
        if residual > 0 {
            instructions.push(InstructionKind::SystemTransfer {
                from: burner,
                to: rent_destination,
                lamports: residual,
            });
        }
        if instructions.is_empty() {
            return Ok(0);
        }

        let mut tx = LedgerTransaction::new(
            burner,
            recent.blockhash,
            recent.last_valid_block_height,
            instructions,
        );
        tx.sign_with(&task.burner);

        let sig = self.ledger.submit_signed(&tx).await?;
        self.ledger.confirm(&sig, tx.last_valid_block_height).await?;

        let rent = if ata_exists {
            self.ledger.min_rent_exempt(TOKEN_ACCOUNT_LEN).await.unwrap_or(0)
        } else {
            0
        };
        let recovered = residual + rent;
        if task.kind == SweepKind::Rollback && recovered > 0 {
            self.recovery.credit_recycled(&task.owner, recovered)?;
        }
        Ok(recovered)
    }
}
