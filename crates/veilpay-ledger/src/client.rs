use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use veilpay_core::constants::{CONFIRM_POLL_MS, READ_RETRY_ATTEMPTS, READ_RETRY_BASE_DELAY_MS};
use veilpay_core::types::{Address, Lamports, RecentBlockhash, TokenAmount, TxSignature};
use veilpay_core::GatewayError;

use crate::rpc::RpcTransport;
use crate::tx::{derive_token_account, LedgerTransaction};

// ── Parsed reads ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Deserialize)]
pub struct TokenBalance {
    /// Amount in the mint's smallest unit, as the ledger reports it.
    pub amount: String,
    pub decimals: u8,
}

impl TokenBalance {
    pub fn value(&self) -> Result<TokenAmount, GatewayError> {
        self.amount
            .parse()
            .map_err(|_| GatewayError::Rpc(format!("unparseable token amount {}", self.amount)))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ParsedInstruction {
    pub program: String,
    #[serde(default)]
    pub info: Value,
}

/// A confirmed transaction as the ledger parses it back.
#[derive(Clone, Debug, Deserialize)]
pub struct ParsedTransaction {
    pub slot: u64,
    pub fee: Lamports,
    pub instructions: Vec<ParsedInstruction>,
}

// ── LedgerClient ─────────────────────────────────────────────────────────────

/// Typed ledger operations over an [`RpcTransport`].
///
/// Reads retry with exponential backoff on rate-limit and transient network
/// failure. Writes never retry implicitly; the orchestrator decides.
pub struct LedgerClient {
    transport: Arc<dyn RpcTransport>,
    explorer_base: String,
}

impl LedgerClient {
    pub fn new(transport: Arc<dyn RpcTransport>, explorer_base: &str) -> Self {
        Self {
            transport,
            explorer_base: explorer_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn explorer_url(&self, sig: &TxSignature) -> String {
        format!("{}/tx/{}", self.explorer_base, sig)
    }

    /// One read with up to three attempts, 1 s initial delay, doubling.
    async fn read(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let mut delay = Duration::from_millis(READ_RETRY_BASE_DELAY_MS);
        let mut attempt = 1;
        loop {
            match self.transport.call(method, params.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < READ_RETRY_ATTEMPTS => {
                    warn!(%method, attempt, "ledger read failed, backing off: {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn latest_blockhash(&self) -> Result<RecentBlockhash, GatewayError> {
        let v = self.read("getLatestBlockhash", json!([])).await?;
        serde_json::from_value(v).map_err(|e| GatewayError::Rpc(format!("blockhash shape: {e}")))
    }

    pub async fn get_balance(&self, addr: &Address) -> Result<Lamports, GatewayError> {
        let v = self.read("getBalance", json!([addr.to_b58()])).await?;
        v.as_u64()
            .ok_or_else(|| GatewayError::Rpc("expected integer balance".into()))
    }

    /// Token balance of `owner`'s canonical account for `mint`. The typed
    /// read fails if the account does not exist or has not propagated yet.
    pub async fn get_token_balance(
        &self,
        owner: &Address,
        mint: &Address,
    ) -> Result<TokenAmount, GatewayError> {
        let ata = derive_token_account(owner, mint);
        let v = self
            .read("getTokenAccountBalance", json!([ata.to_b58()]))
            .await?;
        if v.is_null() {
            return Err(GatewayError::Rpc(format!("no token account at {ata}")));
        }
        let bal: TokenBalance = serde_json::from_value(v)
            .map_err(|e| GatewayError::Rpc(format!("token balance shape: {e}")))?;
        bal.value()
    }

    /// Raw existence probe, the fallback when the typed token read keeps
    /// failing during propagation races.
    pub async fn get_account_exists(&self, addr: &Address) -> Result<bool, GatewayError> {
        let v = self.read("getAccountInfo", json!([addr.to_b58()])).await?;
        Ok(!v.is_null())
    }

    pub async fn min_rent_exempt(&self, data_len: u64) -> Result<Lamports, GatewayError> {
        let v = self
            .read("getMinimumBalanceForRentExemption", json!([data_len]))
            .await?;
        v.as_u64()
            .ok_or_else(|| GatewayError::Rpc("expected integer rent minimum".into()))
    }

    /// Base fee for a single-signature transaction, queried fresh.
    pub async fn base_tx_fee(&self) -> Result<Lamports, GatewayError> {
        let v = self.read("getFeeForMessage", json!([])).await?;
        v.as_u64()
            .ok_or_else(|| GatewayError::Rpc("expected integer fee".into()))
    }

    pub async fn get_block_height(&self) -> Result<u64, GatewayError> {
        let v = self.read("getBlockHeight", json!([])).await?;
        v.as_u64()
            .ok_or_else(|| GatewayError::Rpc("expected integer block height".into()))
    }

    pub async fn get_parsed_transaction(
        &self,
        sig: &TxSignature,
    ) -> Result<ParsedTransaction, GatewayError> {
        let v = self.read("getTransaction", json!([sig.to_b58()])).await?;
        serde_json::from_value(v)
            .map_err(|e| GatewayError::Rpc(format!("parsed transaction shape: {e}")))
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Submit a fully-signed transaction. No implicit retry; a pre-flight
    /// simulation failure surfaces as `LedgerRejected`.
    pub async fn submit_signed(
        &self,
        tx: &LedgerTransaction,
    ) -> Result<TxSignature, GatewayError> {
        if let Some(missing) = tx.missing_signer() {
            return Err(GatewayError::MissingSignature(missing.to_b58()));
        }
        let encoded = tx.encode_base64()?;
        let v = self
            .transport
            .call("sendTransaction", json!([encoded]))
            .await
            .map_err(|e| match e {
                GatewayError::LedgerRateLimited => GatewayError::LedgerRateLimited,
                GatewayError::Rpc(m) => GatewayError::LedgerRejected(m),
                other => other,
            })?;
        let sig_str = v
            .as_str()
            .ok_or_else(|| GatewayError::Rpc("expected signature string".into()))?;
        TxSignature::from_b58(sig_str)
    }

    /// Poll until the signature reaches commitment or the blockhash dies.
    pub async fn confirm(
        &self,
        sig: &TxSignature,
        last_valid_block_height: u64,
    ) -> Result<(), GatewayError> {
        loop {
            let status = self
                .read("getSignatureStatus", json!([sig.to_b58()]))
                .await?;
            if status
                .get("confirmed")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                debug!(%sig, "confirmed");
                return Ok(());
            }
            if let Some(err) = status.get("err").filter(|e| !e.is_null()) {
                return Err(GatewayError::LedgerRejected(err.to_string()));
            }
            let height = self.get_block_height().await?;
            if height > last_valid_block_height {
                return Err(GatewayError::BlockhashExpired(sig.to_b58()));
            }
            tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
        }
    }
}
