//! Typed contracts for the gateway's HTTP surface. The routing layer is an
//! external collaborator: it deserializes bodies into these request types,
//! calls the matching method, and serializes the response (or the error
//! envelope) back out.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use veilpay_audit::{AuditMeta, Challenge};
use veilpay_core::types::{now_ms, Address, Lamports, LinkId, PoolId, TimestampMs, TokenAmount};
use veilpay_core::{GatewayError, PaymentMethod, PaymentSession};
use veilpay_ledger::{derive_token_account, InstructionKind, LedgerTransaction};
use veilpay_orchestrator::{PaymentOutcome, PaymentRequest};
use veilpay_pools::{validate_funding_edge, PoolType};

use crate::context::GatewayContext;

// ── Error envelope ───────────────────────────────────────────────────────────

/// `{success: false, error: <kind>, timestamp: <unix_ms>}`
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: &'static str,
    pub timestamp: TimestampMs,
}

impl From<&GatewayError> for ErrorEnvelope {
    fn from(err: &GatewayError) -> Self {
        Self {
            success: false,
            error: err.kind(),
            timestamp: now_ms(),
        }
    }
}

fn sig_bytes(hex_sig: &str) -> Result<Vec<u8>, GatewayError> {
    hex::decode(hex_sig).map_err(|_| GatewayError::InvalidSignature)
}

// ── Requests / responses ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub owner: String,
    /// Opaque owner-signature bytes, hex.
    pub owner_signature: String,
    pub pool_type: PoolType,
    pub funded_from: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatePoolResponse {
    pub success: bool,
    pub pool_id: PoolId,
    /// Where to send the pool's initial funding.
    pub funding_address: Address,
}

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub owner: String,
    pub owner_signature: String,
    pub source_pool_id: String,
    pub recipient: String,
    pub amount: TokenAmount,
    pub method: Option<PaymentMethod>,
    /// Present when an agent calls on the owner's behalf.
    pub api_key: Option<String>,
    pub resource: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PayResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: PaymentOutcome,
}

#[derive(Debug, Deserialize)]
pub struct FundPoolRequest {
    pub owner: String,
    pub owner_signature: String,
    pub source_pool_id: String,
    pub destination_pool_id: String,
    pub amount: TokenAmount,
}

#[derive(Debug, Serialize)]
pub struct FundPoolResponse {
    pub success: bool,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRecoveryRequest {
    pub owner: String,
    pub owner_signature: String,
    /// Lamports the returned funding transaction will move.
    pub fund_lamports: Lamports,
}

#[derive(Debug, Serialize)]
pub struct CreateRecoveryResponse {
    pub success: bool,
    pub recovery_address: Address,
    /// Unsigned; the owner signs and submits it.
    pub funding_transaction: String,
}

#[derive(Debug, Deserialize)]
pub struct RecoverySweepRequest {
    pub owner: String,
}

#[derive(Debug, Serialize)]
pub struct RecoverySweepResponse {
    pub success: bool,
    pub swept: usize,
    pub lamports_recovered: Lamports,
}

#[derive(Debug, Deserialize)]
pub struct ShadowCreateRequest {
    pub owner: String,
    pub owner_signature: String,
    pub destination_pool_id: String,
    pub expected_amount: TokenAmount,
    pub ttl_secs: u64,
    pub memo: Option<String>,
    pub alias: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ShadowCreateResponse {
    pub success: bool,
    pub link_id: LinkId,
    pub alias: String,
    pub stealth_address: Address,
    pub expires_at: TimestampMs,
}

#[derive(Debug, Deserialize)]
pub struct ShadowSweepRequest {
    pub owner: String,
    pub owner_signature: String,
}

#[derive(Debug, Serialize)]
pub struct ShadowSweepResponse {
    pub success: bool,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditListResponse {
    pub success: bool,
    pub entries: Vec<AuditMeta>,
    /// Sign `challenge.message()` to decrypt via `audit_decrypt`.
    pub challenge: Challenge,
}

#[derive(Debug, Deserialize)]
pub struct AuditDecryptRequest {
    pub owner: String,
    /// Signature over the outstanding challenge, hex.
    pub attestation: String,
    /// The owner-signature material the sessions were sealed under, hex.
    pub owner_signature: String,
}

#[derive(Debug, Serialize)]
pub struct AuditDecryptResponse {
    pub success: bool,
    pub sessions: Vec<PaymentSession>,
}

// ── Endpoints ────────────────────────────────────────────────────────────────

impl GatewayContext {
    /// POST /pool/create
    pub async fn pool_create(
        &self,
        req: CreatePoolRequest,
    ) -> Result<CreatePoolResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("pool/create", &req.owner)?;
        let pool = self.pools.create_pool(
            &owner,
            &sig_bytes(&req.owner_signature)?,
            req.pool_type,
            req.funded_from.map(|id| PoolId::from(id.as_str())),
        )?;
        Ok(CreatePoolResponse {
            success: true,
            pool_id: pool.pool_id,
            funding_address: pool.public_key,
        })
    }

    /// POST /pool/pay
    pub async fn pool_pay(&self, req: PayRequest) -> Result<PayResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("pool/pay", &req.owner)?;

        let agent = match &req.api_key {
            Some(key) => {
                let agent = self.agents.authenticate(key)?;
                if agent.owner_address != owner {
                    return Err(GatewayError::AgentPolicyDenied(
                        "agent does not act for this owner".into(),
                    ));
                }
                let resource = req.resource.clone().unwrap_or_else(|| "pool/pay".into());
                Some((agent.agent_id, resource))
            }
            None => None,
        };

        let outcome = self
            .orchestrator
            .pay(PaymentRequest {
                owner,
                owner_signature: sig_bytes(&req.owner_signature)?,
                source_pool_id: PoolId::from(req.source_pool_id.as_str()),
                recipient: req.recipient,
                amount: req.amount,
                method_hint: req.method,
                agent,
            })
            .await?;
        Ok(PayResponse {
            success: true,
            outcome,
        })
    }

    /// POST /pool/fund-pool — hierarchy-validated inter-pool transfer. The
    /// edge is checked before any blockhash is fetched.
    pub async fn pool_fund(&self, req: FundPoolRequest) -> Result<FundPoolResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("pool/fund-pool", &req.owner)?;
        if req.amount == 0 {
            return Err(GatewayError::ZeroAmount);
        }

        let src_id = PoolId::from(req.source_pool_id.as_str());
        let dst_id = PoolId::from(req.destination_pool_id.as_str());
        let src = self.pools.get(&src_id)?;
        let dst = self.pools.get(&dst_id)?;
        for pool in [&src, &dst] {
            if pool.owner_address != owner {
                return Err(GatewayError::ForeignPool {
                    pool: pool.pool_id.to_string(),
                    owner: owner.to_b58(),
                });
            }
        }
        validate_funding_edge(src.pool_type, dst.pool_type)?;

        let signer = self
            .pools
            .unlock(&src_id, &sig_bytes(&req.owner_signature)?)?;

        let recent = self.ledger.latest_blockhash().await?;
        let mint = self.config.mint;
        let mut tx = LedgerTransaction::new(
            src.public_key,
            recent.blockhash,
            recent.last_valid_block_height,
            vec![
                InstructionKind::CreateTokenAccountIdempotent {
                    payer: src.public_key,
                    owner: dst.public_key,
                    mint,
                },
                InstructionKind::TokenTransferChecked {
                    source: derive_token_account(&src.public_key, &mint),
                    destination: derive_token_account(&dst.public_key, &mint),
                    authority: src.public_key,
                    mint,
                    amount: req.amount,
                    decimals: self.config.token_decimals,
                },
            ],
        );
        tx.sign_with(&signer);

        let sig = self.ledger.submit_signed(&tx).await?;
        self.ledger.confirm(&sig, tx.last_valid_block_height).await?;
        self.pools.mark_funded(&dst_id)?;

        Ok(FundPoolResponse {
            success: true,
            signature: sig.to_b58(),
        })
    }

    /// POST /recovery/create
    pub async fn recovery_create(
        &self,
        req: CreateRecoveryRequest,
    ) -> Result<CreateRecoveryResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("recovery/create", &req.owner)?;
        let (pool, funding) = self
            .recovery
            .create(&owner, &sig_bytes(&req.owner_signature)?, req.fund_lamports)
            .await?;
        Ok(CreateRecoveryResponse {
            success: true,
            recovery_address: pool.public_key,
            funding_transaction: funding.encode_base64()?,
        })
    }

    /// POST /recovery/sweep
    pub async fn recovery_sweep(
        &self,
        req: RecoverySweepRequest,
    ) -> Result<RecoverySweepResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("recovery/sweep", &req.owner)?;
        let (swept, lamports_recovered) = self.sweeps.sweep_owner_now(&owner).await;
        Ok(RecoverySweepResponse {
            success: true,
            swept,
            lamports_recovered,
        })
    }

    /// POST /shadow/create
    pub async fn shadow_create(
        &self,
        req: ShadowCreateRequest,
    ) -> Result<ShadowCreateResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("shadow/create", &req.owner)?;

        let destination = self.pools.get(&PoolId::from(req.destination_pool_id.as_str()))?;
        if destination.owner_address != owner {
            return Err(GatewayError::ForeignPool {
                pool: destination.pool_id.to_string(),
                owner: owner.to_b58(),
            });
        }

        let link = self.shadow.create_link(
            &owner,
            &sig_bytes(&req.owner_signature)?,
            destination.public_key,
            req.expected_amount,
            req.ttl_secs,
            req.memo.as_deref(),
            req.alias,
        )?;
        Ok(ShadowCreateResponse {
            success: true,
            link_id: link.link_id,
            alias: link.alias,
            stealth_address: link.stealth_address,
            expires_at: link.expires_at,
        })
    }

    /// POST /shadow/{id}/sweep
    pub async fn shadow_sweep(
        &self,
        link_id: &str,
        req: ShadowSweepRequest,
    ) -> Result<ShadowSweepResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        self.throttler.check("shadow/sweep", &req.owner)?;
        // A sweep settles value; it counts against the owner's rate window.
        self.recovery.rate_check(&owner).await?;

        let id = LinkId::from(link_id);
        let link = self.shadow.get(&id)?;
        if link.owner_address != owner {
            return Err(GatewayError::ShadowLinkNotFound(link_id.to_string()));
        }

        let sig = self
            .shadow
            .sweep(&id, &sig_bytes(&req.owner_signature)?)
            .await?;
        Ok(ShadowSweepResponse {
            success: true,
            signature: sig.to_b58(),
        })
    }

    /// GET /audit/{owner} — metadata only, plus a fresh decryption
    /// challenge. Deduplicated across concurrent callers.
    pub async fn audit_list(&self, owner: &str) -> Result<AuditListResponse, GatewayError> {
        let owner = Address::from_b58(owner)?;
        let audit = Arc::clone(&self.audit);
        let key = format!("audit/list:{owner}");

        let value = self
            .throttler
            .dedup(&key, Duration::from_millis(250), move || {
                async move {
                    let entries = audit.entries(&owner);
                    let challenge = audit.issue_challenge(&owner);
                    serde_json::to_value(AuditListResponse {
                        success: true,
                        entries,
                        challenge,
                    })
                    .unwrap_or(Value::Null)
                }
                .boxed()
            })
            .await;

        serde_json::from_value(value).map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    /// POST /audit/decrypt
    pub async fn audit_decrypt(
        &self,
        req: AuditDecryptRequest,
    ) -> Result<AuditDecryptResponse, GatewayError> {
        let owner = Address::from_b58(&req.owner)?;
        let sessions = self.audit.decrypt_batch(
            &owner,
            &sig_bytes(&req.attestation)?,
            &sig_bytes(&req.owner_signature)?,
        )?;
        Ok(AuditDecryptResponse {
            success: true,
            sessions,
        })
    }
}
