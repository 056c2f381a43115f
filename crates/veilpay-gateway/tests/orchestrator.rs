//! End-to-end payment flows against a simulated ledger: the mock transport
//! executes submitted transactions (fees, rent, token moves) so the
//! four-phase machine, the sweeps, and the accounting are exercised for
//! real.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use veilpay_core::constants::MIN_LIQUIDITY_LAMPORTS;
use veilpay_core::types::{Address, PoolId, TxSignature};
use veilpay_core::{FailStage, GatewayError, PaymentMethod, SessionStatus};
use veilpay_facilitator::FacilitatorHttp;
use veilpay_gateway::{GatewayConfig, GatewayContext};
use veilpay_ledger::{derive_token_account, InstructionKind, LedgerTransaction, RpcTransport};
use veilpay_orchestrator::PaymentRequest;
use veilpay_pools::PoolType;
use veilpay_vault::{verify_owner_signature, Signer};

const FEE: u64 = 5_000;
const RENT0: u64 = 890_880;
const RENT_ATA: u64 = 2_039_280;

const MINT: Address = Address([77u8; 32]);
const OWNER_SIG: &[u8] = b"owner-sig-material";

// ── Simulated ledger state ───────────────────────────────────────────────────

#[derive(Default)]
struct MockState {
    balances: HashMap<Address, u64>,
    token_accounts: HashMap<Address, u64>,
    /// Typed token-balance reads to hide, simulating RPC propagation lag.
    hidden_token_reads: u32,
    blockhash_fetches: u32,
    fail_next_close: bool,
    sig_counter: u8,
}

impl MockState {
    fn next_sig(&mut self) -> TxSignature {
        self.sig_counter = self.sig_counter.wrapping_add(1);
        TxSignature::from_bytes([self.sig_counter; 64])
    }

    /// Execute a transaction atomically: on any error the balances roll
    /// back, as a rejected transaction leaves no trace on the ledger.
    fn apply(&mut self, tx: &LedgerTransaction, fee_payer_cosigned: bool) -> Result<(), String> {
        let snapshot = (self.balances.clone(), self.token_accounts.clone());
        let result = self.apply_inner(tx, fee_payer_cosigned);
        if result.is_err() {
            self.balances = snapshot.0;
            self.token_accounts = snapshot.1;
        }
        result
    }

    fn apply_inner(&mut self, tx: &LedgerTransaction, fee_payer_cosigned: bool) -> Result<(), String> {
        let message = tx.message_bytes();
        for (addr, sig) in &tx.signatures {
            if !verify_owner_signature(addr, &message, sig.as_bytes()) {
                return Err(format!("bad signature from {addr}"));
            }
        }
        for required in tx.required_signers() {
            if required == tx.fee_payer && fee_payer_cosigned {
                continue;
            }
            if !tx.signatures.contains_key(&required) {
                return Err(format!("missing signature from {required}"));
            }
        }

        let payer = self.balances.entry(tx.fee_payer).or_insert(0);
        if *payer < FEE {
            return Err("fee payer insolvent".into());
        }
        *payer -= FEE;

        for ix in &tx.instructions {
            match ix {
                InstructionKind::SystemTransfer { from, to, lamports } => {
                    let from_balance = self.balances.entry(*from).or_insert(0);
                    if *from_balance < *lamports {
                        return Err("insufficient lamports".into());
                    }
                    *from_balance -= lamports;
                    *self.balances.entry(*to).or_insert(0) += lamports;
                }
                InstructionKind::CreateTokenAccountIdempotent { payer, owner, mint } => {
                    let ata = derive_token_account(owner, mint);
                    if !self.token_accounts.contains_key(&ata) {
                        let payer_balance = self.balances.entry(*payer).or_insert(0);
                        if *payer_balance < RENT_ATA {
                            return Err("cannot fund token account rent".into());
                        }
                        *payer_balance -= RENT_ATA;
                        self.token_accounts.insert(ata, 0);
                    }
                }
                InstructionKind::TokenTransferChecked {
                    source,
                    destination,
                    amount,
                    ..
                } => {
                    let src = self
                        .token_accounts
                        .get_mut(source)
                        .ok_or("source token account missing")?;
                    if *src < *amount {
                        return Err("insufficient token balance".into());
                    }
                    *src -= amount;
                    *self
                        .token_accounts
                        .get_mut(destination)
                        .ok_or("destination token account missing")? += amount;
                }
                InstructionKind::CloseTokenAccount {
                    account,
                    destination,
                    ..
                } => {
                    if self.fail_next_close {
                        self.fail_next_close = false;
                        return Err("close rejected".into());
                    }
                    match self.token_accounts.get(account) {
                        Some(0) => {
                            self.token_accounts.remove(account);
                            *self.balances.entry(*destination).or_insert(0) += RENT_ATA;
                        }
                        Some(_) => return Err("token account not empty".into()),
                        None => return Err("token account missing".into()),
                    }
                }
                InstructionKind::ComputeUnitLimit { .. }
                | InstructionKind::ComputeUnitPrice { .. } => {}
            }
        }
        Ok(())
    }
}

struct MockLedger {
    state: Arc<Mutex<MockState>>,
    hang_submits: AtomicBool,
}

#[async_trait]
impl RpcTransport for MockLedger {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        match method {
            "getLatestBlockhash" => {
                self.state.lock().unwrap().blockhash_fetches += 1;
                Ok(json!({ "blockhash": "mock-hash", "last_valid_block_height": 10_000u64 }))
            }
            "getBalance" => {
                let addr = Address::from_b58(params[0].as_str().unwrap()).unwrap();
                Ok(json!(self.state.lock().unwrap().balances.get(&addr).copied().unwrap_or(0)))
            }
            "getTokenAccountBalance" => {
                let ata = Address::from_b58(params[0].as_str().unwrap()).unwrap();
                let mut state = self.state.lock().unwrap();
                if state.hidden_token_reads > 0 {
                    state.hidden_token_reads -= 1;
                    return Ok(Value::Null);
                }
                match state.token_accounts.get(&ata) {
                    Some(amount) => Ok(json!({ "amount": amount.to_string(), "decimals": 6 })),
                    None => Ok(Value::Null),
                }
            }
            "getAccountInfo" => {
                let addr = Address::from_b58(params[0].as_str().unwrap()).unwrap();
                let state = self.state.lock().unwrap();
                let exists = state.token_accounts.contains_key(&addr)
                    || state.balances.get(&addr).copied().unwrap_or(0) > 0;
                Ok(if exists { json!({ "lamports": 1 }) } else { Value::Null })
            }
            "getMinimumBalanceForRentExemption" => {
                let len = params[0].as_u64().unwrap_or(0);
                Ok(json!(if len == 0 { RENT0 } else { RENT_ATA }))
            }
            "getFeeForMessage" => Ok(json!(FEE)),
            "getBlockHeight" => Ok(json!(1u64)),
            "sendTransaction" => {
                if self.hang_submits.load(Ordering::SeqCst) {
                    futures_pending().await;
                }
                let tx = LedgerTransaction::decode_base64(params[0].as_str().unwrap())
                    .map_err(|e| GatewayError::Rpc(e.to_string()))?;
                let mut state = self.state.lock().unwrap();
                state
                    .apply(&tx, false)
                    .map_err(GatewayError::Rpc)?;
                Ok(json!(state.next_sig().to_b58()))
            }
            "getSignatureStatus" => Ok(json!({ "confirmed": true })),
            "getTransaction" => Ok(json!({ "slot": 1u64, "fee": FEE, "instructions": [] })),
            other => Err(GatewayError::Rpc(format!("unhandled method {other}"))),
        }
    }
}

async fn futures_pending() {
    std::future::pending::<()>().await
}

// ── Simulated facilitator ────────────────────────────────────────────────────

struct MockFacilitator {
    state: Arc<Mutex<MockState>>,
    fee_payer: Address,
    reject_settles: bool,
    unavailable: bool,
}

#[async_trait]
impl FacilitatorHttp for MockFacilitator {
    async fn get_supported(&self) -> Result<Value, GatewayError> {
        if self.unavailable {
            return Err(GatewayError::FacilitatorUnavailable("probe timeout".into()));
        }
        Ok(json!({
            "kinds": [{ "network": "mainnet", "extra": { "feePayer": self.fee_payer.to_b58() } }]
        }))
    }

    async fn post_settle(&self, body: Value) -> Result<Value, GatewayError> {
        if self.unavailable {
            return Err(GatewayError::FacilitatorUnavailable("settle timeout".into()));
        }
        if self.reject_settles {
            return Ok(json!({ "success": false, "errorReason": "simulation_failed" }));
        }

        let encoded = body["paymentPayload"]["payload"]["transaction"]
            .as_str()
            .expect("settle payload shape");
        let tx = LedgerTransaction::decode_base64(encoded)
            .map_err(|e| GatewayError::FacilitatorRejected(e.to_string()))?;

        // The facilitator insists on its exact instruction layout.
        let shape_ok = tx.instructions.len() == 3
            && matches!(tx.instructions[0], InstructionKind::ComputeUnitLimit { .. })
            && matches!(tx.instructions[1], InstructionKind::ComputeUnitPrice { .. })
            && matches!(tx.instructions[2], InstructionKind::TokenTransferChecked { .. });
        if !shape_ok || tx.fee_payer != self.fee_payer {
            return Ok(json!({ "success": false, "errorReason": "invalid_transaction" }));
        }

        let mut state = self.state.lock().unwrap();
        if let Err(reason) = state.apply(&tx, true) {
            return Ok(json!({ "success": false, "errorReason": reason }));
        }
        Ok(json!({ "success": true, "transaction": state.next_sig().to_b58() }))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    ctx: Arc<GatewayContext>,
    state: Arc<Mutex<MockState>>,
    owner: Address,
    pool_id: PoolId,
    pool_address: Address,
    pool_ata: Address,
    recipient: Address,
    recovery_address: Address,
    _dir: tempfile::TempDir,
}

struct HarnessOptions {
    reject_settles: bool,
    facilitator_unavailable: bool,
    hang_submits: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            reject_settles: false,
            facilitator_unavailable: false,
            hang_submits: false,
        }
    }
}

async fn harness(opts: HarnessOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(Mutex::new(MockState::default()));
    let facilitator_fee_payer = Signer::generate().address();

    let config = GatewayConfig {
        data_dir: dir.path().to_path_buf(),
        ledger_rpc_url: "mock".into(),
        explorer_base: "https://explorer.example".into(),
        facilitator_url: "mock".into(),
        network: "mainnet".into(),
        mint: MINT,
        token_decimals: 6,
    };
    let ctx = GatewayContext::open(
        config,
        Arc::new(MockLedger {
            state: Arc::clone(&state),
            hang_submits: AtomicBool::new(opts.hang_submits),
        }),
        Box::new(MockFacilitator {
            state: Arc::clone(&state),
            fee_payer: facilitator_fee_payer,
            reject_settles: opts.reject_settles,
            unavailable: opts.facilitator_unavailable,
        }),
    )
    .unwrap();

    let owner = Signer::generate().address();
    let recipient = Signer::generate().address();

    let pool = ctx
        .pools
        .create_pool(&owner, OWNER_SIG, PoolType::Root, None)
        .unwrap();
    let (recovery, _funding) = ctx.recovery.create(&owner, OWNER_SIG, 0).await.unwrap();

    let pool_ata = derive_token_account(&pool.public_key, &MINT);
    {
        let mut s = state.lock().unwrap();
        s.balances.insert(pool.public_key, 50_000_000);
        s.balances.insert(recovery.public_key, 20_000_000);
        s.balances.insert(facilitator_fee_payer, 10_000_000);
        s.token_accounts.insert(pool_ata, 1_000_000);
        s.token_accounts.insert(derive_token_account(&recipient, &MINT), 0);
    }

    Harness {
        owner,
        pool_id: pool.pool_id.clone(),
        pool_address: pool.public_key,
        pool_ata,
        recipient,
        recovery_address: recovery.public_key,
        ctx,
        state,
        _dir: dir,
    }
}

fn pay_request(h: &Harness, amount: u64, method: Option<PaymentMethod>) -> PaymentRequest {
    PaymentRequest {
        owner: h.owner,
        owner_signature: OWNER_SIG.to_vec(),
        source_pool_id: h.pool_id.clone(),
        recipient: h.recipient.to_b58(),
        amount,
        method_hint: method,
        agent: None,
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn gasless_happy_path_settles_and_recovers() {
    let h = harness(HarnessOptions::default()).await;

    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.method, PaymentMethod::Gasless);
    assert_eq!(outcome.transactions.len(), 4);

    let s = h.state.lock().unwrap();
    let recipient_ata = derive_token_account(&h.recipient, &MINT);
    assert_eq!(s.token_accounts[&recipient_ata], 70_000);
    assert_eq!(s.token_accounts[&h.pool_ata], 930_000);

    // The burner is fully destroyed: its token account is gone.
    assert!(s
        .token_accounts
        .keys()
        .all(|a| *a == recipient_ata || *a == h.pool_ata));

    // Rent conservation: net cost equals the observed fees, and the
    // facilitator exempted Phase 3.
    assert_eq!(outcome.net_cost, 3 * FEE);
    assert_eq!(outcome.net_cost, outcome.transactions.iter().map(|t| t.fee).sum::<u64>());
    assert_eq!(s.balances[&h.pool_address], 50_000_000 - 3 * FEE);
}

#[tokio::test(start_paused = true)]
async fn direct_payment_spends_four_fees() {
    let h = harness(HarnessOptions::default()).await;

    let outcome = h
        .ctx
        .orchestrator
        .pay(pay_request(&h, 25_000, Some(PaymentMethod::Direct)))
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.method, PaymentMethod::Direct);
    assert_eq!(outcome.net_cost, 4 * FEE);

    let s = h.state.lock().unwrap();
    assert_eq!(s.token_accounts[&derive_token_account(&h.recipient, &MINT)], 25_000);
}

#[tokio::test(start_paused = true)]
async fn sixth_payment_in_window_is_rate_limited() {
    let h = harness(HarnessOptions::default()).await;

    for _ in 0..5 {
        let outcome = h.ctx.orchestrator.pay(pay_request(&h, 1_000, None)).await.unwrap();
        assert_eq!(outcome.status, SessionStatus::Completed);
    }
    let err = h.ctx.orchestrator.pay(pay_request(&h, 1_000, None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::RateLimited { .. }));

    // No partial on-chain effect from the refused request.
    let s = h.state.lock().unwrap();
    assert_eq!(s.token_accounts[&derive_token_account(&h.recipient, &MINT)], 5_000);
}

#[tokio::test(start_paused = true)]
async fn propagation_race_falls_back_to_raw_read() {
    let h = harness(HarnessOptions::default()).await;
    h.state.lock().unwrap().hidden_token_reads = 3;

    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    let s = h.state.lock().unwrap();
    assert_eq!(s.hidden_token_reads, 0);
    assert_eq!(s.token_accounts[&derive_token_account(&h.recipient, &MINT)], 70_000);
}

#[tokio::test(start_paused = true)]
async fn facilitator_rejection_fails_session_and_sweep_recycles_rent() {
    let h = harness(HarnessOptions {
        reject_settles: true,
        ..HarnessOptions::default()
    })
    .await;

    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed(FailStage::Settle));
    assert_eq!(h.ctx.sweeps.pending_count(), 1);

    let (swept, recovered) = h.ctx.sweeps.sweep_owner_now(&h.owner).await;
    assert_eq!(swept, 1);
    // The stranded stablecoin went home and the burner rent was recycled.
    let s = h.state.lock().unwrap();
    assert_eq!(s.token_accounts[&h.pool_ata], 1_000_000);
    assert!(recovered >= RENT_ATA);
    drop(s);
    assert_eq!(
        h.ctx.recovery.get(&h.owner).unwrap().total_recycled,
        recovered
    );
    let s = h.state.lock().unwrap();
    assert!(s.balances[&h.recovery_address] > 20_000_000);
}

#[tokio::test(start_paused = true)]
async fn facilitator_outage_falls_back_to_direct() {
    let h = harness(HarnessOptions {
        facilitator_unavailable: true,
        ..HarnessOptions::default()
    })
    .await;

    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.method, PaymentMethod::Direct);

    // The failed probe disables gasless for the next session outright.
    assert!(!h.ctx.facilitator.healthy());
    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 1_000, None)).await.unwrap();
    assert_eq!(outcome.method, PaymentMethod::Direct);
}

#[tokio::test(start_paused = true)]
async fn phase_four_failure_leaves_partial_with_retry_queued() {
    let h = harness(HarnessOptions::default()).await;
    h.state.lock().unwrap().fail_next_close = true;

    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap();

    // The recipient was paid; only rent recovery is outstanding.
    assert_eq!(outcome.status, SessionStatus::Partial);
    let s = h.state.lock().unwrap();
    assert_eq!(s.token_accounts[&derive_token_account(&h.recipient, &MINT)], 70_000);
    drop(s);
    assert_eq!(h.ctx.sweeps.pending_count(), 1);

    let (swept, recovered) = h.ctx.sweeps.sweep_owner_now(&h.owner).await;
    assert_eq!(swept, 1);
    assert!(recovered >= RENT_ATA);
    // Phase-4 retries return rent to the source pool, not the recovery pool.
    assert_eq!(h.ctx.recovery.get(&h.owner).unwrap().total_recycled, 0);
}

#[tokio::test(start_paused = true)]
async fn zero_amount_is_refused_before_any_effect() {
    let h = harness(HarnessOptions::default()).await;
    let before = h.state.lock().unwrap().blockhash_fetches;

    let err = h.ctx.orchestrator.pay(pay_request(&h, 0, None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::ZeroAmount));
    assert_eq!(h.state.lock().unwrap().blockhash_fetches, before);
}

#[tokio::test(start_paused = true)]
async fn stuck_session_is_failed_by_the_watchdog() {
    let h = harness(HarnessOptions {
        hang_submits: true,
        ..HarnessOptions::default()
    })
    .await;

    let outcome = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed(FailStage::Stuck));
    assert_eq!(h.ctx.sweeps.pending_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn insufficient_recovery_liquidity_refuses_payment() {
    let h = harness(HarnessOptions::default()).await;
    h.state
        .lock()
        .unwrap()
        .balances
        .insert(h.recovery_address, MIN_LIQUIDITY_LAMPORTS);

    let err = h.ctx.orchestrator.pay(pay_request(&h, 70_000, None)).await.unwrap_err();
    assert!(matches!(err, GatewayError::InsufficientLiquidity { .. }));
}

#[tokio::test(start_paused = true)]
async fn setup_resubmission_is_idempotent_for_the_token_account() {
    let h = harness(HarnessOptions::default()).await;
    let pool_signer = h.ctx.pools.unlock(&h.pool_id, OWNER_SIG).unwrap();
    let burner = Signer::generate();

    let build = |recent: &veilpay_core::RecentBlockhash| {
        let mut tx = LedgerTransaction::new(
            h.pool_address,
            recent.blockhash.clone(),
            recent.last_valid_block_height,
            vec![
                InstructionKind::SystemTransfer {
                    from: h.pool_address,
                    to: burner.address(),
                    lamports: RENT0 + FEE,
                },
                InstructionKind::CreateTokenAccountIdempotent {
                    payer: h.pool_address,
                    owner: burner.address(),
                    mint: MINT,
                },
            ],
        );
        tx.sign_with(&pool_signer);
        tx
    };

    let recent = h.ctx.ledger.latest_blockhash().await.unwrap();
    h.ctx.ledger.submit_signed(&build(&recent)).await.unwrap();
    let after_first = h.state.lock().unwrap().balances[&h.pool_address];

    h.ctx.ledger.submit_signed(&build(&recent)).await.unwrap();
    let after_second = h.state.lock().unwrap().balances[&h.pool_address];

    // Second attempt pays only the transfer and the fee; the token account
    // create is a no-op.
    assert_eq!(after_first - after_second, RENT0 + 2 * FEE);
}

#[tokio::test(start_paused = true)]
async fn concurrent_payments_serialize_on_the_pool_guard() {
    let h = harness(HarnessOptions::default()).await;

    let (a, b) = tokio::join!(
        h.ctx.orchestrator.pay(pay_request(&h, 10_000, None)),
        h.ctx.orchestrator.pay(pay_request(&h, 20_000, None)),
    );
    assert_eq!(a.unwrap().status, SessionStatus::Completed);
    assert_eq!(b.unwrap().status, SessionStatus::Completed);

    let s = h.state.lock().unwrap();
    assert_eq!(s.token_accounts[&derive_token_account(&h.recipient, &MINT)], 30_000);
    assert_eq!(s.token_accounts[&h.pool_ata], 970_000);
}

#[tokio::test(start_paused = true)]
async fn hierarchy_violation_precedes_any_blockhash_fetch() {
    let h = harness(HarnessOptions::default()).await;

    let mid = h
        .ctx
        .pools
        .create_pool(&h.owner, OWNER_SIG, PoolType::Intermediate, Some(h.pool_id.clone()))
        .unwrap();
    let leaf = h
        .ctx
        .pools
        .create_pool(&h.owner, OWNER_SIG, PoolType::Leaf, Some(mid.pool_id.clone()))
        .unwrap();

    let before = h.state.lock().unwrap().blockhash_fetches;
    let err = h
        .ctx
        .pool_fund(veilpay_gateway::api::FundPoolRequest {
            owner: h.owner.to_b58(),
            owner_signature: hex::encode(OWNER_SIG),
            source_pool_id: h.pool_id.to_string(),
            destination_pool_id: leaf.pool_id.to_string(),
            amount: 10_000,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::HierarchyViolation { .. }));
    assert_eq!(h.state.lock().unwrap().blockhash_fetches, before);
}
