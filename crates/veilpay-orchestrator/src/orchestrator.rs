use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use veilpay_core::constants::{
    PROPAGATION_WAIT_MS, SESSION_WATCHDOG_SECS, TOKEN_ACCOUNT_LEN, VERIFY_RETRY_ATTEMPTS,
};
use veilpay_core::types::{
    now_ms, Address, AgentId, Lamports, PoolId, RecentBlockhash, SessionId, TokenAmount,
    TxSignature,
};
use veilpay_core::{
    FailStage, GatewayError, PaymentMethod, PaymentPhase, PaymentSession, SessionStatus,
    TransactionRecord,
};
use veilpay_audit::AuditLogger;
use veilpay_facilitator::{FacilitatorAdapter, SettleRequirements};
use veilpay_ledger::{derive_token_account, InstructionKind, LedgerClient, LedgerTransaction};
use veilpay_policy::AgentRegistry;
use veilpay_pools::PoolRegistry;
use veilpay_recovery::RecoveryRegistry;
use veilpay_vault::Signer;

use crate::sweep::{SweepKind, SweepQueue, SweepTask};

// ── Request / outcome ────────────────────────────────────────────────────────

pub struct PaymentRequest {
    pub owner: Address,
    /// Opaque owner-signature bytes: unlocks the pool and seals the audit
    /// entry.
    pub owner_signature: Vec<u8>,
    pub source_pool_id: PoolId,
    /// Recipient address as supplied; validated before any side effect.
    pub recipient: String,
    pub amount: TokenAmount,
    pub method_hint: Option<PaymentMethod>,
    /// Present when an agent initiated the payment: (agent, resource).
    pub agent: Option<(AgentId, String)>,
}

/// What the caller gets back; the full session lives on only inside the
/// encrypted audit log.
#[derive(Clone, Debug, Serialize)]
pub struct PaymentOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub method: PaymentMethod,
    pub transactions: Vec<TransactionRecord>,
    pub sol_funded: Lamports,
    pub sol_recovered: Lamports,
    pub net_cost: Lamports,
}

impl PaymentOutcome {
    fn of(session: &PaymentSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            method: session.method,
            transactions: session.transactions.clone(),
            sol_funded: session.sol_funded,
            sol_recovered: session.sol_recovered,
            net_cost: session.net_cost(),
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct PaymentOrchestrator {
    ledger: Arc<LedgerClient>,
    facilitator: Arc<FacilitatorAdapter>,
    pools: Arc<PoolRegistry>,
    recovery: Arc<RecoveryRegistry>,
    audit: Arc<AuditLogger>,
    agents: Arc<AgentRegistry>,
    sweeps: Arc<SweepQueue>,
    mint: Address,
    decimals: u8,
    /// Cancellation flags for sessions still ahead of Phase 1.
    cancellable: Mutex<HashMap<SessionId, Arc<AtomicBool>>>,
}

impl PaymentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<LedgerClient>,
        facilitator: Arc<FacilitatorAdapter>,
        pools: Arc<PoolRegistry>,
        recovery: Arc<RecoveryRegistry>,
        audit: Arc<AuditLogger>,
        agents: Arc<AgentRegistry>,
        sweeps: Arc<SweepQueue>,
        mint: Address,
        decimals: u8,
    ) -> Self {
        Self {
            ledger,
            facilitator,
            pools,
            recovery,
            audit,
            agents,
            sweeps,
            mint,
            decimals,
            cancellable: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel a session that has not yet funded its burner. Once Phase 1 is
    /// underway the machine runs to a terminal state instead.
    pub fn cancel(&self, session_id: &SessionId) -> Result<(), GatewayError> {
        match self
            .cancellable
            .lock()
            .expect("cancel map poisoned")
            .get(session_id)
        {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(GatewayError::CancellationRefused(session_id.to_string())),
        }
    }

    // ── Entry point ──────────────────────────────────────────────────────────

    pub async fn pay(&self, req: PaymentRequest) -> Result<PaymentOutcome, GatewayError> {
        // ── Preconditions, in order, before any on-chain side effect ─────────
        if let Some((agent_id, resource)) = &req.agent {
            self.agents.check(agent_id, resource, req.amount)?;
        }

        let pool = self.pools.get(&req.source_pool_id)?;
        if pool.owner_address != req.owner {
            return Err(GatewayError::ForeignPool {
                pool: req.source_pool_id.to_string(),
                owner: req.owner.to_b58(),
            });
        }
        let pool_signer = self.pools.unlock(&req.source_pool_id, &req.owner_signature)?;

        let recipient = Address::from_b58(&req.recipient)?;
        if req.amount == 0 {
            return Err(GatewayError::ZeroAmount);
        }

        self.recovery.rate_check(&req.owner).await?;

        // Gasless wins when available, unless the facilitator's most recent
        // probe failed inside the health window.
        let method = match req.method_hint {
            Some(PaymentMethod::Direct) => PaymentMethod::Direct,
            _ if self.facilitator.healthy() => PaymentMethod::Gasless,
            _ => PaymentMethod::Direct,
        };

        // Budget, all queried from the ledger at reservation time.
        let rent_sysacct = self.ledger.min_rent_exempt(0).await?;
        let rent_ata = self.ledger.min_rent_exempt(TOKEN_ACCOUNT_LEN).await?;
        let base_fee = self.ledger.base_tx_fee().await?;
        let tx_count: u64 = match method {
            PaymentMethod::Direct => 4,
            PaymentMethod::Gasless => 3,
        };
        let budget = rent_sysacct + rent_ata + tx_count * base_fee;

        let burner = Arc::new(Signer::generate());
        let mut session = PaymentSession::new(
            req.owner,
            pool.public_key,
            burner.address(),
            recipient,
            req.amount,
            method,
        );

        self.recovery
            .reserve(&req.owner, budget, &session.session_id)
            .await?;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancellable
            .lock()
            .expect("cancel map poisoned")
            .insert(session.session_id.clone(), Arc::clone(&cancel_flag));

        // One in-flight payment per source pool.
        let guard = self.pools.pool_guard(&req.source_pool_id);
        let _held = guard.lock().await;

        // Last cancellation point: nothing on-chain has happened yet.
        if cancel_flag.load(Ordering::SeqCst) {
            self.cleanup_flags(&session.session_id);
            self.recovery.release(&req.owner, &session.session_id).await;
            session.finish(SessionStatus::Failed(FailStage::Setup));
            return Ok(PaymentOutcome::of(&session));
        }

        session.status = SessionStatus::InProgress;
        let run = self.run_phases(
            &mut session,
            &pool_signer,
            &burner,
            rent_sysacct,
            rent_ata,
            base_fee,
        );
        let outcome = tokio::time::timeout(Duration::from_secs(SESSION_WATCHDOG_SECS), run).await;

        self.cleanup_flags(&session.session_id);
        self.recovery.release(&req.owner, &session.session_id).await;

        match outcome {
            Ok(Ok(())) => {
                session.finish(SessionStatus::Completed);
                let _ = self.pools.mark_active(&req.source_pool_id);
                if let Some((agent_id, _)) = &req.agent {
                    let _ = self.agents.record_spend(agent_id, req.amount);
                }
                info!(session = %session.session_id, "payment completed");
            }
            Ok(Err((stage, err))) => {
                warn!(session = %session.session_id, ?stage, "payment failed: {err}");
                self.dispose_failure(&mut session, stage, &req.owner, &burner, pool.public_key);
                if session.status == SessionStatus::Partial {
                    if let Some((agent_id, _)) = &req.agent {
                        let _ = self.agents.record_spend(agent_id, req.amount);
                    }
                }
            }
            Err(_elapsed) => {
                warn!(session = %session.session_id, "session exceeded watchdog, failing stuck");
                session.finish(SessionStatus::Failed(FailStage::Stuck));
                self.enqueue_sweep(SweepKind::Rollback, &req.owner, &burner, pool.public_key);
            }
        }

        if let Err(e) = self
            .audit
            .seal(&req.owner, &req.owner_signature, &session)
        {
            warn!(session = %session.session_id, "audit seal failed: {e}");
        }
        Ok(PaymentOutcome::of(&session))
    }

    fn cleanup_flags(&self, session_id: &SessionId) {
        self.cancellable
            .lock()
            .expect("cancel map poisoned")
            .remove(session_id);
    }

    /// Apply the per-phase failure table: Phase 1 leaves nothing to clean;
    /// anything later gets a rollback sweep; a Phase-4-only failure is a
    /// successful payment with rent outstanding.
    fn dispose_failure(
        &self,
        session: &mut PaymentSession,
        stage: FailStage,
        owner: &Address,
        burner: &Arc<Signer>,
        source_pool: Address,
    ) {
        match stage {
            FailStage::Setup => {
                session.finish(SessionStatus::Failed(FailStage::Setup));
            }
            FailStage::Stock | FailStage::Settle => {
                self.enqueue_sweep(SweepKind::Rollback, owner, burner, source_pool);
                session.finish(SessionStatus::Failed(stage));
            }
            FailStage::Recover => {
                self.enqueue_sweep(SweepKind::RecoverRent, owner, burner, source_pool);
                session.finish(SessionStatus::Partial);
            }
            FailStage::Stuck => {
                self.enqueue_sweep(SweepKind::Rollback, owner, burner, source_pool);
                session.finish(SessionStatus::Failed(FailStage::Stuck));
            }
        }
    }

    fn enqueue_sweep(
        &self,
        kind: SweepKind,
        owner: &Address,
        burner: &Arc<Signer>,
        source_pool: Address,
    ) {
        self.sweeps.enqueue(SweepTask {
            kind,
            owner: *owner,
            burner: Arc::clone(burner),
            source_pool,
        });
    }

    // ── The four phases ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        session: &mut PaymentSession,
        pool_signer: &Signer,
        burner: &Arc<Signer>,
        rent_sysacct: Lamports,
        rent_ata: Lamports,
        base_fee: Lamports,
    ) -> Result<(), (FailStage, GatewayError)> {
        let pool_address = session.pool_address;
        let burner_address = session.burner_public_key;
        let recipient = session.recipient_address;
        let amount = session.amount;
        let pool_ata = derive_token_account(&pool_address, &self.mint);
        let burner_ata = derive_token_account(&burner_address, &self.mint);
        let recipient_ata = derive_token_account(&recipient, &self.mint);

        // Phase 1 — Setup. The burner gets rent plus the gas it will burn
        // itself: Phase 4 always, Phase 3 too when settling directly.
        let burner_gas = match session.method {
            PaymentMethod::Direct => 2 * base_fee,
            PaymentMethod::Gasless => base_fee,
        };
        let fund_lamports = rent_sysacct + burner_gas;
        self.execute_phase(session, PaymentPhase::Setup, &[pool_signer], |recent| {
            LedgerTransaction::new(
                pool_address,
                recent.blockhash.clone(),
                recent.last_valid_block_height,
                vec![
                    InstructionKind::SystemTransfer {
                        from: pool_address,
                        to: burner_address,
                        lamports: fund_lamports,
                    },
                    InstructionKind::CreateTokenAccountIdempotent {
                        payer: pool_address,
                        owner: burner_address,
                        mint: self.mint,
                    },
                ],
            )
        })
        .await
        .map_err(|e| (FailStage::Setup, e))?;
        session.sol_funded = fund_lamports + rent_ata + session.total_fees();

        // Phase 2 — Stock.
        let fees_before = session.total_fees();
        self.execute_phase(session, PaymentPhase::Stock, &[pool_signer], |recent| {
            LedgerTransaction::new(
                pool_address,
                recent.blockhash.clone(),
                recent.last_valid_block_height,
                vec![InstructionKind::TokenTransferChecked {
                    source: pool_ata,
                    destination: burner_ata,
                    authority: pool_address,
                    mint: self.mint,
                    amount,
                    decimals: self.decimals,
                }],
            )
        })
        .await
        .map_err(|e| (FailStage::Stock, e))?;
        session.sol_funded += session.total_fees() - fees_before;

        // Pre-flight verification: the facilitator simulates against its own
        // RPC view, so the burner's token account must be visible before
        // Phase 3 goes out.
        self.verify_burner_stocked(&burner_address, &burner_ata, amount)
            .await
            .map_err(|e| (FailStage::Stock, e))?;

        // Phase 3 — Settle.
        match session.method {
            PaymentMethod::Gasless => {
                match self
                    .settle_gasless(session, burner, burner_ata, recipient_ata)
                    .await
                {
                    Ok(()) => {}
                    Err(GatewayError::FacilitatorUnavailable(reason)) => {
                        // Health is already marked; fall back to paying gas
                        // from the burner's buffer.
                        warn!(session = %session.session_id, "gasless unavailable ({reason}), settling direct");
                        session.method = PaymentMethod::Direct;
                        self.settle_direct(session, burner, burner_ata, recipient_ata)
                            .await
                            .map_err(|e| (FailStage::Settle, e))?;
                    }
                    Err(e) => return Err((FailStage::Settle, e)),
                }
            }
            PaymentMethod::Direct => {
                self.settle_direct(session, burner, burner_ata, recipient_ata)
                    .await
                    .map_err(|e| (FailStage::Settle, e))?;
            }
        }

        // Phase 4 — Recovery.
        let balance = self
            .ledger
            .get_balance(&burner_address)
            .await
            .map_err(|e| (FailStage::Recover, e))?;
        let residual = balance.saturating_sub(base_fee);
        self.execute_phase(session, PaymentPhase::Recover, &[burner.as_ref()], |recent| {
            LedgerTransaction::new(
                burner_address,
                recent.blockhash.clone(),
                recent.last_valid_block_height,
                vec![
                    InstructionKind::CloseTokenAccount {
                        account: burner_ata,
                        destination: pool_address,
                        authority: burner_address,
                    },
                    InstructionKind::SystemTransfer {
                        from: burner_address,
                        to: pool_address,
                        lamports: residual,
                    },
                ],
            )
        })
        .await
        .map_err(|e| (FailStage::Recover, e))?;
        session.sol_recovered = rent_ata + residual;
        Ok(())
    }

    /// Build, sign, submit, confirm one phase transaction; one blockhash
    /// refresh on expiry; record the observed fee.
    async fn execute_phase<F>(
        &self,
        session: &mut PaymentSession,
        phase: PaymentPhase,
        signers: &[&Signer],
        mut build: F,
    ) -> Result<(), GatewayError>
    where
        F: FnMut(&RecentBlockhash) -> LedgerTransaction,
    {
        let mut refreshed = false;
        loop {
            let recent = self.ledger.latest_blockhash().await?;
            let mut tx = build(&recent);
            for signer in signers {
                tx.sign_with(signer);
            }
            let sig = self.ledger.submit_signed(&tx).await?;
            match self
                .ledger
                .confirm(&sig, recent.last_valid_block_height)
                .await
            {
                Ok(()) => {
                    self.record_confirmed(session, phase, sig).await;
                    return Ok(());
                }
                Err(GatewayError::BlockhashExpired(_)) if !refreshed => {
                    warn!(session = %session.session_id, phase = phase.label(), "blockhash expired, retrying once");
                    refreshed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_confirmed(
        &self,
        session: &mut PaymentSession,
        phase: PaymentPhase,
        sig: TxSignature,
    ) {
        let fee = match self.ledger.get_parsed_transaction(&sig).await {
            Ok(parsed) => parsed.fee,
            Err(e) => {
                warn!(%sig, "fee read-back failed, recording zero: {e}");
                0
            }
        };
        session.record_phase(TransactionRecord {
            phase,
            signature: sig,
            fee,
            confirmed_at: now_ms(),
            explorer_url: self.ledger.explorer_url(&sig),
        });
    }

    /// Post-stock verification: typed balance read at 1 s, 2 s, 3 s, then a
    /// raw account-exists fallback.
    async fn verify_burner_stocked(
        &self,
        burner: &Address,
        burner_ata: &Address,
        amount: TokenAmount,
    ) -> Result<(), GatewayError> {
        tokio::time::sleep(Duration::from_millis(PROPAGATION_WAIT_MS)).await;

        for attempt in 1..=VERIFY_RETRY_ATTEMPTS {
            match self.ledger.get_token_balance(burner, &self.mint).await {
                Ok(balance) if balance >= amount => return Ok(()),
                Ok(balance) => {
                    warn!(%burner, balance, expected = amount, "burner stocked below expectation")
                }
                Err(e) => warn!(%burner, attempt, "typed burner read failed: {e}"),
            }
            tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
        }

        if self.ledger.get_account_exists(burner_ata).await? {
            info!(%burner, "typed reads kept failing; raw account probe succeeded");
            return Ok(());
        }
        Err(GatewayError::BurnerAtaMissing)
    }

    async fn settle_direct(
        &self,
        session: &mut PaymentSession,
        burner: &Arc<Signer>,
        burner_ata: Address,
        recipient_ata: Address,
    ) -> Result<(), GatewayError> {
        let burner_address = session.burner_public_key;
        let amount = session.amount;
        let mint = self.mint;
        let decimals = self.decimals;
        self.execute_phase(session, PaymentPhase::Settle, &[burner.as_ref()], |recent| {
            LedgerTransaction::new(
                burner_address,
                recent.blockhash.clone(),
                recent.last_valid_block_height,
                vec![InstructionKind::TokenTransferChecked {
                    source: burner_ata,
                    destination: recipient_ata,
                    authority: burner_address,
                    mint,
                    amount,
                    decimals,
                }],
            )
        })
        .await
    }

    /// Gasless settle: facilitator fee payer, compute-budget pair first,
    /// exactly one transfer, burner partial signature.
    async fn settle_gasless(
        &self,
        session: &mut PaymentSession,
        burner: &Arc<Signer>,
        burner_ata: Address,
        recipient_ata: Address,
    ) -> Result<(), GatewayError> {
        let fee_payer = self.facilitator.fee_payer().await?;
        let recent = self.ledger.latest_blockhash().await?;

        let mut tx = LedgerTransaction::new(
            fee_payer,
            recent.blockhash,
            recent.last_valid_block_height,
            vec![
                InstructionKind::ComputeUnitLimit { units: 200_000 },
                InstructionKind::ComputeUnitPrice { micro_lamports: 1 },
                InstructionKind::TokenTransferChecked {
                    source: burner_ata,
                    destination: recipient_ata,
                    authority: session.burner_public_key,
                    mint: self.mint,
                    amount: session.amount,
                    decimals: self.decimals,
                },
            ],
        );
        tx.sign_with(burner);

        let reqs = SettleRequirements {
            amount: session.amount,
            asset: self.mint,
            pay_to: session.recipient_address,
            fee_payer,
            resource: "pool/pay".into(),
        };
        let sig = self.facilitator.settle(&tx.encode_base64()?, &reqs).await?;
        self.ledger
            .confirm(&sig, tx.last_valid_block_height)
            .await?;

        // The facilitator pays this fee; it is not part of the owner's cost.
        session.record_phase(TransactionRecord {
            phase: PaymentPhase::Settle,
            signature: sig,
            fee: 0,
            confirmed_at: now_ms(),
            explorer_url: self.ledger.explorer_url(&sig),
        });
        Ok(())
    }
}
