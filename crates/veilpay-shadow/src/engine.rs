use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use veilpay_core::constants::ALIAS_RETENTION_SECS;
use veilpay_core::types::{now_ms, Address, LinkId, TimestampMs, TokenAmount, TxSignature};
use veilpay_core::GatewayError;
use veilpay_ledger::{derive_token_account, InstructionKind, LedgerClient, LedgerTransaction};
use veilpay_state::DocumentStore;
use veilpay_vault::{encrypt_secret, fresh_salt, Signer};

use crate::link::{LinkStatus, ShadowLink};

// Alias vocabulary. Collisions are retried, so short lists are fine.
const ALIAS_LEFT: &[&str] = &[
    "amber", "cobalt", "dusk", "ember", "frost", "iris", "jade", "onyx", "quartz", "slate",
];
const ALIAS_RIGHT: &[&str] = &[
    "fox", "heron", "lynx", "marten", "otter", "raven", "sable", "swift", "vole", "wren",
];

fn random_alias() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{:02}",
        ALIAS_LEFT[rng.gen_range(0..ALIAS_LEFT.len())],
        ALIAS_RIGHT[rng.gen_range(0..ALIAS_RIGHT.len())],
        rng.gen_range(0..100u32)
    )
}

/// The shadow link state machine.
pub struct ShadowEngine {
    store: Arc<DocumentStore<ShadowLink>>,
    ledger: Arc<LedgerClient>,
    mint: Address,
    decimals: u8,
}

impl ShadowEngine {
    pub fn new(
        store: Arc<DocumentStore<ShadowLink>>,
        ledger: Arc<LedgerClient>,
        mint: Address,
        decimals: u8,
    ) -> Self {
        Self {
            store,
            ledger,
            mint,
            decimals,
        }
    }

    /// An alias is free if no live link holds it and every terminal holder
    /// left the retention window behind.
    fn alias_free(&self, alias: &str, now: TimestampMs) -> bool {
        let retention_ms = (ALIAS_RETENTION_SECS as i64) * 1_000;
        !self.store.all().into_iter().any(|(_, link)| {
            link.alias == alias
                && match link.terminal_at {
                    Some(t) if link.status.is_terminal() => now - t < retention_ms,
                    _ => true,
                }
        })
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    pub fn create_link(
        &self,
        owner: &Address,
        owner_sig: &[u8],
        destination_pool_address: Address,
        expected_amount: TokenAmount,
        ttl_secs: u64,
        memo: Option<&str>,
        alias: Option<String>,
    ) -> Result<ShadowLink, GatewayError> {
        if expected_amount == 0 {
            return Err(GatewayError::ZeroAmount);
        }
        let now = now_ms();

        let alias = match alias {
            Some(a) => {
                if !self.alias_free(&a, now) {
                    return Err(GatewayError::AliasTaken(a));
                }
                a
            }
            None => loop {
                let candidate = random_alias();
                if self.alias_free(&candidate, now) {
                    break candidate;
                }
            },
        };

        let stealth = Signer::generate();
        let salt = fresh_salt();
        let sealed = encrypt_secret(stealth.secret_bytes().as_slice(), owner, owner_sig, &salt)?;
        let memo = memo
            .map(|m| encrypt_secret(m.as_bytes(), owner, owner_sig, &salt))
            .transpose()?;

        let link = ShadowLink {
            link_id: LinkId::generate(),
            alias,
            stealth_address: stealth.address(),
            encrypted_secret_key: sealed,
            encryption_salt: salt,
            owner_address: *owner,
            destination_pool_address,
            expected_amount,
            memo,
            expires_at: now + (ttl_secs as i64) * 1_000,
            status: LinkStatus::Waiting,
            payment_tx: None,
            sweep_tx: None,
            paid_from: None,
            created_at: now,
            terminal_at: None,
        };
        self.store.insert(link.link_id.to_string(), link.clone());
        info!(link = %link.link_id, alias = %link.alias, "shadow link created");
        Ok(link)
    }

    // ── Retrieval ────────────────────────────────────────────────────────────

    pub fn get(&self, link_id: &LinkId) -> Result<ShadowLink, GatewayError> {
        self.store
            .get(link_id.as_str())
            .ok_or_else(|| GatewayError::ShadowLinkNotFound(link_id.to_string()))
    }

    /// Resolve a live invoice for a payer. Anything past `waiting` surfaces
    /// as the matching gone-equivalent error.
    pub fn resolve_alias(&self, alias: &str) -> Result<ShadowLink, GatewayError> {
        let link = self
            .store
            .all()
            .into_iter()
            .map(|(_, l)| l)
            .filter(|l| l.alias == alias)
            .max_by_key(|l| l.created_at)
            .ok_or_else(|| GatewayError::ShadowLinkNotFound(alias.to_string()))?;

        match link.status {
            LinkStatus::Waiting if now_ms() > link.expires_at => {
                self.transition(&link.link_id, LinkStatus::Expired)?;
                Err(GatewayError::ShadowLinkExpired)
            }
            LinkStatus::Waiting => Ok(link),
            LinkStatus::Paid | LinkStatus::Swept => Err(GatewayError::ShadowLinkUsed),
            LinkStatus::Expired => Err(GatewayError::ShadowLinkExpired),
            LinkStatus::Cancelled => Err(GatewayError::ShadowLinkCancelled),
        }
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    fn transition(&self, link_id: &LinkId, status: LinkStatus) -> Result<(), GatewayError> {
        self.store.modify(|records| match records.get_mut(link_id.as_str()) {
            Some(link) => {
                link.status = status;
                if status.is_terminal() {
                    link.terminal_at = Some(now_ms());
                }
                Ok(())
            }
            None => Err(GatewayError::ShadowLinkNotFound(link_id.to_string())),
        })
    }

    /// Poll the stealth balance; flip to paid once it covers the expectation.
    pub async fn check_paid(&self, link_id: &LinkId) -> Result<LinkStatus, GatewayError> {
        let link = self.get(link_id)?;
        if link.status != LinkStatus::Waiting {
            return Ok(link.status);
        }
        if now_ms() > link.expires_at {
            self.transition(link_id, LinkStatus::Expired)?;
            return Ok(LinkStatus::Expired);
        }

        match self
            .ledger
            .get_token_balance(&link.stealth_address, &self.mint)
            .await
        {
            Ok(balance) if balance >= link.expected_amount => {
                self.mark_paid(link_id, None, None)?;
                Ok(LinkStatus::Paid)
            }
            // Account not created yet or below expectation: still waiting.
            _ => Ok(LinkStatus::Waiting),
        }
    }

    /// Explicit owner confirmation carrying the payment signature.
    pub fn confirm_paid(
        &self,
        link_id: &LinkId,
        payment_tx: TxSignature,
        paid_from: Option<Address>,
    ) -> Result<(), GatewayError> {
        let link = self.get(link_id)?;
        if link.status != LinkStatus::Waiting {
            return Err(match link.status {
                LinkStatus::Expired => GatewayError::ShadowLinkExpired,
                LinkStatus::Cancelled => GatewayError::ShadowLinkCancelled,
                _ => GatewayError::ShadowLinkUsed,
            });
        }
        self.mark_paid(link_id, Some(payment_tx), paid_from)
    }

    fn mark_paid(
        &self,
        link_id: &LinkId,
        payment_tx: Option<TxSignature>,
        paid_from: Option<Address>,
    ) -> Result<(), GatewayError> {
        self.store.modify(|records| match records.get_mut(link_id.as_str()) {
            Some(link) => {
                link.status = LinkStatus::Paid;
                link.payment_tx = payment_tx;
                link.paid_from = paid_from;
                Ok(())
            }
            None => Err(GatewayError::ShadowLinkNotFound(link_id.to_string())),
        })?;
        info!(link = %link_id, "shadow link paid");
        Ok(())
    }

    /// Owner cancel. Only a waiting link cancels; a paid link keeps its
    /// manual sweep outstanding.
    pub fn cancel(&self, link_id: &LinkId) -> Result<(), GatewayError> {
        let link = self.get(link_id)?;
        match link.status {
            LinkStatus::Waiting => self.transition(link_id, LinkStatus::Cancelled),
            LinkStatus::Paid => Err(GatewayError::ShadowLinkNotPaid),
            LinkStatus::Swept => Err(GatewayError::ShadowLinkUsed),
            LinkStatus::Expired => Err(GatewayError::ShadowLinkExpired),
            LinkStatus::Cancelled => Ok(()),
        }
    }

    /// Background tick: expire waiting links past their deadline.
    pub fn expire_due(&self) -> usize {
        let now = now_ms();
        self.store.modify(|records| {
            let mut n = 0;
            for link in records.values_mut() {
                if link.status == LinkStatus::Waiting && now > link.expires_at {
                    link.status = LinkStatus::Expired;
                    link.terminal_at = Some(now);
                    n += 1;
                }
            }
            n
        })
    }

    // ── Sweep ────────────────────────────────────────────────────────────────

    /// Move the full stealth balance into the destination pool, close the
    /// stealth token account, return residual lamports, and retire the link.
    /// Only a paid link sweeps; a swept link refuses without mutating.
    pub async fn sweep(
        &self,
        link_id: &LinkId,
        owner_sig: &[u8],
    ) -> Result<TxSignature, GatewayError> {
        let link = self.get(link_id)?;
        match link.status {
            LinkStatus::Paid => {}
            LinkStatus::Swept => return Err(GatewayError::ShadowLinkUsed),
            _ => return Err(GatewayError::ShadowLinkNotPaid),
        }

        let plain = link.encrypted_secret_key.decrypt_with(
            &link.owner_address,
            owner_sig,
            &link.encryption_salt,
        )?;
        let stealth = Signer::from_secret_bytes(plain.as_slice())?;
        if stealth.address() != link.stealth_address {
            return Err(GatewayError::MismatchedKey(link_id.to_string()));
        }

        let token_balance = self
            .ledger
            .get_token_balance(&link.stealth_address, &self.mint)
            .await?;
        let lamports = self.ledger.get_balance(&link.stealth_address).await?;
        let fee = self.ledger.base_tx_fee().await?;
        let recent = self.ledger.latest_blockhash().await?;

        let stealth_ata = derive_token_account(&link.stealth_address, &self.mint);
        let dest_ata = derive_token_account(&link.destination_pool_address, &self.mint);
        let residual = lamports.saturating_sub(fee);

        let mut tx = LedgerTransaction::new(
            link.stealth_address,
            recent.blockhash,
            recent.last_valid_block_height,
            vec![
                InstructionKind::CreateTokenAccountIdempotent {
                    payer: link.stealth_address,
                    owner: link.destination_pool_address,
                    mint: self.mint,
                },
                InstructionKind::TokenTransferChecked {
                    source: stealth_ata,
                    destination: dest_ata,
                    authority: link.stealth_address,
                    mint: self.mint,
                    amount: token_balance,
                    decimals: self.decimals,
                },
                InstructionKind::CloseTokenAccount {
                    account: stealth_ata,
                    destination: link.destination_pool_address,
                    authority: link.stealth_address,
                },
                InstructionKind::SystemTransfer {
                    from: link.stealth_address,
                    to: link.destination_pool_address,
                    lamports: residual,
                },
            ],
        );
        tx.sign_with(&stealth);

        let sig = self.ledger.submit_signed(&tx).await?;
        self.ledger.confirm(&sig, tx.last_valid_block_height).await?;

        self.store.modify(|records| match records.get_mut(link_id.as_str()) {
            Some(link) => {
                link.status = LinkStatus::Swept;
                link.sweep_tx = Some(sig);
                link.terminal_at = Some(now_ms());
                Ok(())
            }
            None => Err(GatewayError::ShadowLinkNotFound(link_id.to_string())),
        })?;
        debug!(link = %link_id, %sig, "stealth account emptied and closed");
        info!(link = %link_id, "shadow link swept");
        Ok(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use veilpay_ledger::RpcTransport;

    /// Scripted ledger: a token balance that appears after a few polls, plus
    /// canned submit/confirm plumbing.
    struct ScriptedLedger {
        balances: Mutex<Vec<u64>>,
        submitted: Mutex<Vec<String>>,
    }

    impl ScriptedLedger {
        fn new(balances: Vec<u64>) -> Self {
            Self {
                balances: Mutex::new(balances),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedLedger {
        async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
            match method {
                "getTokenAccountBalance" => {
                    let mut b = self.balances.lock().unwrap();
                    let amount = if b.len() > 1 { b.remove(0) } else { b[0] };
                    if amount == 0 {
                        Ok(Value::Null)
                    } else {
                        Ok(json!({ "amount": amount.to_string(), "decimals": 6 }))
                    }
                }
                "getBalance" => Ok(json!(900_000u64)),
                "getFeeForMessage" => Ok(json!(5_000u64)),
                "getLatestBlockhash" => Ok(json!({
                    "blockhash": "hash",
                    "last_valid_block_height": 100u64
                })),
                "sendTransaction" => {
                    self.submitted
                        .lock()
                        .unwrap()
                        .push(params[0].as_str().unwrap().to_string());
                    Ok(json!(TxSignature::from_bytes([9; 64]).to_b58()))
                }
                "getSignatureStatus" => Ok(json!({ "confirmed": true })),
                _ => Ok(Value::Null),
            }
        }
    }

    fn engine(balances: Vec<u64>) -> (ShadowEngine, Arc<ScriptedLedger>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedLedger::new(balances));
        let ledger = Arc::new(LedgerClient::new(
            Arc::clone(&transport) as Arc<dyn RpcTransport>,
            "https://explorer.example",
        ));
        let store = DocumentStore::load(dir.path().join("links.json")).unwrap();
        let mint = Address::from_bytes([77; 32]);
        (ShadowEngine::new(store, ledger, mint, 6), transport, dir)
    }

    fn owner_pair() -> (Signer, Address) {
        let s = Signer::generate();
        let a = s.address();
        (s, a)
    }

    #[tokio::test]
    async fn lifecycle_waiting_paid_swept() {
        let (eng, transport, _dir) = engine(vec![0, 250_000]);
        let (_, owner) = owner_pair();
        let dest = Address::from_bytes([8; 32]);

        let link = eng
            .create_link(&owner, b"sig", dest, 250_000, 600, Some("invoice #42"), None)
            .unwrap();
        assert_eq!(link.status, LinkStatus::Waiting);
        assert_eq!(eng.resolve_alias(&link.alias).unwrap().link_id, link.link_id);

        // First poll: account missing. Second: funded.
        assert_eq!(eng.check_paid(&link.link_id).await.unwrap(), LinkStatus::Waiting);
        assert_eq!(eng.check_paid(&link.link_id).await.unwrap(), LinkStatus::Paid);

        let sig = eng.sweep(&link.link_id, b"sig").await.unwrap();
        let after = eng.get(&link.link_id).unwrap();
        assert_eq!(after.status, LinkStatus::Swept);
        assert_eq!(after.sweep_tx, Some(sig));
        assert_eq!(transport.submitted.lock().unwrap().len(), 1);

        // The sweep transaction carries the full expected amount.
        let encoded = transport.submitted.lock().unwrap()[0].clone();
        let tx = LedgerTransaction::decode_base64(&encoded).unwrap();
        assert!(tx.instructions.iter().any(|ix| matches!(
            ix,
            InstructionKind::TokenTransferChecked { amount: 250_000, .. }
        )));
        assert!(tx
            .instructions
            .iter()
            .any(|ix| matches!(ix, InstructionKind::CloseTokenAccount { .. })));
    }

    #[tokio::test]
    async fn double_sweep_fails_without_mutation() {
        let (eng, _t, _dir) = engine(vec![250_000]);
        let (_, owner) = owner_pair();
        let link = eng
            .create_link(&owner, b"sig", Address::from_bytes([8; 32]), 250_000, 600, None, None)
            .unwrap();
        eng.check_paid(&link.link_id).await.unwrap();
        eng.sweep(&link.link_id, b"sig").await.unwrap();

        let before = eng.get(&link.link_id).unwrap();
        let err = eng.sweep(&link.link_id, b"sig").await.unwrap_err();
        assert!(matches!(err, GatewayError::ShadowLinkUsed));
        let after = eng.get(&link.link_id).unwrap();
        assert_eq!(after.sweep_tx, before.sweep_tx);
        assert_eq!(after.status, LinkStatus::Swept);
    }

    #[tokio::test]
    async fn sweeping_an_unpaid_link_is_refused() {
        let (eng, _t, _dir) = engine(vec![0]);
        let (_, owner) = owner_pair();
        let link = eng
            .create_link(&owner, b"sig", Address::from_bytes([8; 32]), 100, 600, None, None)
            .unwrap();
        let err = eng.sweep(&link.link_id, b"sig").await.unwrap_err();
        assert!(matches!(err, GatewayError::ShadowLinkNotPaid));
    }

    #[tokio::test]
    async fn alias_unique_among_live_links() {
        let (eng, _t, _dir) = engine(vec![0]);
        let (_, owner) = owner_pair();
        let dest = Address::from_bytes([8; 32]);

        eng.create_link(&owner, b"sig", dest, 100, 600, None, Some("quartz-wren-07".into()))
            .unwrap();
        let err = eng
            .create_link(&owner, b"sig", dest, 100, 600, None, Some("quartz-wren-07".into()))
            .unwrap_err();
        assert!(matches!(err, GatewayError::AliasTaken(_)));
    }

    #[tokio::test]
    async fn expiry_and_cancel_paths() {
        let (eng, _t, _dir) = engine(vec![0]);
        let (_, owner) = owner_pair();
        let dest = Address::from_bytes([8; 32]);

        let expiring = eng
            .create_link(&owner, b"sig", dest, 100, 0, None, None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(eng.expire_due(), 1);
        assert!(matches!(
            eng.resolve_alias(&expiring.alias).unwrap_err(),
            GatewayError::ShadowLinkExpired
        ));

        let cancelled = eng
            .create_link(&owner, b"sig", dest, 100, 600, None, None)
            .unwrap();
        eng.cancel(&cancelled.link_id).unwrap();
        assert!(matches!(
            eng.resolve_alias(&cancelled.alias).unwrap_err(),
            GatewayError::ShadowLinkCancelled
        ));
    }

    #[tokio::test]
    async fn wrong_owner_signature_cannot_sweep() {
        let (eng, _t, _dir) = engine(vec![100]);
        let (_, owner) = owner_pair();
        let link = eng
            .create_link(&owner, b"sig", Address::from_bytes([8; 32]), 100, 600, None, None)
            .unwrap();
        eng.check_paid(&link.link_id).await.unwrap();
        let err = eng.sweep(&link.link_id, b"forged").await.unwrap_err();
        assert!(matches!(err, GatewayError::KeyVaultAuthFailed));
    }
}
