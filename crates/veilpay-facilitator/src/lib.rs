//! veilpay-facilitator
//!
//! Adapter for the x402-style settlement facilitator: discovers the current
//! fee payer, hands over base64 partially-signed transactions for completion
//! and submission, and tracks facilitator health so the orchestrator can
//! fall back to direct settlement.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use veilpay_core::constants::{
    FACILITATOR_HEALTH_WINDOW_SECS, FACILITATOR_TIMEOUT_SECS, FEE_PAYER_CACHE_TTL_SECS,
};
use veilpay_core::types::{Address, TokenAmount, TxSignature};
use veilpay_core::GatewayError;

/// Protocol version of the settlement payload.
const X402_VERSION: u32 = 1;

/// Payment scheme advertised in both payload and requirements.
const SCHEME: &str = "exact";

// ── HTTP seam ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait FacilitatorHttp: Send + Sync {
    async fn get_supported(&self) -> Result<Value, GatewayError>;
    async fn post_settle(&self, body: Value) -> Result<Value, GatewayError>;
}

/// reqwest-backed facilitator endpoint with the 30 s hard timeout.
pub struct HttpFacilitator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFacilitator {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(FACILITATOR_TIMEOUT_SECS))
                .build()
                .expect("reqwest client construction is infallible"),
        }
    }
}

#[async_trait]
impl FacilitatorHttp for HttpFacilitator {
    async fn get_supported(&self) -> Result<Value, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/supported", self.base_url))
            .send()
            .await
            .map_err(|e| GatewayError::FacilitatorUnavailable(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| GatewayError::FacilitatorUnavailable(e.to_string()))
    }

    async fn post_settle(&self, body: Value) -> Result<Value, GatewayError> {
        let resp = self
            .client
            .post(format!("{}/settle", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::FacilitatorUnavailable(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| GatewayError::FacilitatorUnavailable(e.to_string()))
    }
}

// ── Normalized discovery ─────────────────────────────────────────────────────

/// What the rest of the gateway sees of `/supported`, whatever shape the
/// facilitator spoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FacilitatorInfo {
    pub fee_payer: Address,
}

/// `/supported` advertises the fee payer either as
/// `kinds[].extra.feePayer` (matching our network) or as
/// `signers["chain:<network>"]`. Both normalize here; the raw shapes go no
/// further.
fn parse_fee_payer(v: &Value, network: &str) -> Result<FacilitatorInfo, GatewayError> {
    if let Some(kinds) = v.get("kinds").and_then(Value::as_array) {
        for kind in kinds {
            let matches_network = kind
                .get("network")
                .and_then(Value::as_str)
                .map(|n| n == network)
                .unwrap_or(true);
            if !matches_network {
                continue;
            }
            if let Some(fp) = kind
                .get("extra")
                .and_then(|e| e.get("feePayer"))
                .and_then(Value::as_str)
            {
                return Ok(FacilitatorInfo {
                    fee_payer: Address::from_b58(fp)?,
                });
            }
        }
    }
    if let Some(signers) = v.get("signers").and_then(Value::as_object) {
        for (key, val) in signers {
            if key.starts_with("chain:") {
                if let Some(fp) = val.as_str() {
                    return Ok(FacilitatorInfo {
                        fee_payer: Address::from_b58(fp)?,
                    });
                }
            }
        }
    }
    Err(GatewayError::FacilitatorUnavailable(
        "no fee payer advertised for this network".into(),
    ))
}

// ── Settlement requirements ──────────────────────────────────────────────────

/// Metadata accompanying a settlement: what the facilitator verifies the
/// transaction against before co-signing.
#[derive(Clone, Debug)]
pub struct SettleRequirements {
    pub amount: TokenAmount,
    /// The stablecoin mint.
    pub asset: Address,
    /// The recipient of the transfer.
    pub pay_to: Address,
    pub fee_payer: Address,
    /// Resource identifier the payment is attributed to.
    pub resource: String,
}

// ── Adapter ──────────────────────────────────────────────────────────────────

/// Stateless between calls except for the cached fee payer and the health
/// mark of the most recent probe.
pub struct FacilitatorAdapter {
    http: Box<dyn FacilitatorHttp>,
    network: String,
    cached: Mutex<Option<(FacilitatorInfo, Instant)>>,
    last_failure: Mutex<Option<Instant>>,
}

impl FacilitatorAdapter {
    pub fn new(http: Box<dyn FacilitatorHttp>, network: &str) -> Self {
        Self {
            http,
            network: network.to_string(),
            cached: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    /// True unless the most recent probe failed within the health window.
    pub fn healthy(&self) -> bool {
        match *self.last_failure.lock().expect("health mark poisoned") {
            Some(at) => at.elapsed().as_secs() >= FACILITATOR_HEALTH_WINDOW_SECS,
            None => true,
        }
    }

    fn mark_failure(&self) {
        *self.last_failure.lock().expect("health mark poisoned") = Some(Instant::now());
        // Force a fresh probe on the next attempt.
        *self.cached.lock().expect("fee payer cache poisoned") = None;
    }

    fn mark_success(&self) {
        *self.last_failure.lock().expect("health mark poisoned") = None;
    }

    /// The facilitator's current fee payer, cached for five minutes.
    pub async fn fee_payer(&self) -> Result<Address, GatewayError> {
        if let Some((info, at)) = *self.cached.lock().expect("fee payer cache poisoned") {
            if at.elapsed().as_secs() < FEE_PAYER_CACHE_TTL_SECS {
                return Ok(info.fee_payer);
            }
        }

        let raw = self.http.get_supported().await.inspect_err(|e| {
            warn!("facilitator discovery failed: {e}");
            self.mark_failure();
        })?;
        let info = parse_fee_payer(&raw, &self.network).inspect_err(|_| self.mark_failure())?;

        *self.cached.lock().expect("fee payer cache poisoned") = Some((info, Instant::now()));
        self.mark_success();
        debug!(fee_payer = %info.fee_payer, "facilitator fee payer discovered");
        Ok(info.fee_payer)
    }

    /// Submit a base64 partially-signed transaction for completion. Returns
    /// the confirmed signature.
    pub async fn settle(
        &self,
        transaction_b64: &str,
        reqs: &SettleRequirements,
    ) -> Result<TxSignature, GatewayError> {
        let body = json!({
            "paymentPayload": {
                "x402Version": X402_VERSION,
                "scheme": SCHEME,
                "network": self.network,
                "payload": { "transaction": transaction_b64 }
            },
            "paymentRequirements": {
                "scheme": SCHEME,
                "network": self.network,
                "maxAmountRequired": reqs.amount.to_string(),
                "resource": reqs.resource,
                "payTo": reqs.pay_to.to_b58(),
                "maxTimeoutSeconds": FACILITATOR_TIMEOUT_SECS,
                "asset": reqs.asset.to_b58(),
                "extra": { "feePayer": reqs.fee_payer.to_b58() }
            }
        });

        let resp = self.http.post_settle(body).await.inspect_err(|e| {
            warn!("facilitator settle call failed: {e}");
            self.mark_failure();
        })?;

        if resp.get("success").and_then(Value::as_bool) == Some(true) {
            self.mark_success();
            let sig = resp
                .get("transaction")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::FacilitatorRejected("settled without a signature".into())
                })?;
            return TxSignature::from_b58(sig);
        }

        let reason = resp
            .get("errorReason")
            .and_then(Value::as_str)
            .unwrap_or("unspecified")
            .to_string();
        Err(GatewayError::FacilitatorRejected(reason))
    }
}
