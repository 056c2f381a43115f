use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Key vault ────────────────────────────────────────────────────────────
    #[error("owner signature does not authenticate this ciphertext")]
    KeyVaultAuthFailed,

    #[error("decrypted key does not match the persisted public key for pool {0}")]
    MismatchedKey(String),

    #[error("pool {0} is locked; reauthenticate with a fresh owner signature")]
    PoolLocked(String),

    // ── Pool hierarchy ───────────────────────────────────────────────────────
    #[error("funding edge {src} -> {dst} violates the pool hierarchy")]
    HierarchyViolation { src: String, dst: String },

    #[error("owner {0} already has a root pool")]
    RootAlreadyExists(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool {pool} is not owned by {owner}")]
    ForeignPool { pool: String, owner: String },

    // ── Liquidity & rate limits ──────────────────────────────────────────────
    #[error("insufficient recovery liquidity: need {needed} lamports, {available} available")]
    InsufficientLiquidity { needed: u64, available: u64 },

    #[error("rate limited; retry after {retry_after_secs} s")]
    RateLimited { retry_after_secs: u64 },

    #[error("recovery pool not found for owner {0}")]
    RecoveryPoolNotFound(String),

    #[error("owner {0} already has a recovery pool")]
    RecoveryPoolExists(String),

    // ── Ledger ───────────────────────────────────────────────────────────────
    #[error("ledger RPC rate limited")]
    LedgerRateLimited,

    #[error("blockhash expired before confirmation of {0}")]
    BlockhashExpired(String),

    #[error("transaction rejected by the ledger: {0}")]
    LedgerRejected(String),

    #[error("ledger RPC error: {0}")]
    Rpc(String),

    #[error("burner token account never became visible after all retries")]
    BurnerAtaMissing,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("transaction is missing required signature from {0}")]
    MissingSignature(String),

    // ── Facilitator ──────────────────────────────────────────────────────────
    #[error("facilitator unavailable: {0}")]
    FacilitatorUnavailable(String),

    #[error("facilitator rejected settlement: {0}")]
    FacilitatorRejected(String),

    // ── Agent policy ─────────────────────────────────────────────────────────
    #[error("agent policy denied: {0}")]
    AgentPolicyDenied(String),

    #[error("agent not found or key not recognized")]
    AgentAuthFailed,

    // ── Payments ─────────────────────────────────────────────────────────────
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} is past the point of cancellation")]
    CancellationRefused(String),

    // ── Shadow links ─────────────────────────────────────────────────────────
    #[error("shadow link has expired")]
    ShadowLinkExpired,

    #[error("shadow link was already used")]
    ShadowLinkUsed,

    #[error("shadow link was cancelled")]
    ShadowLinkCancelled,

    #[error("shadow link not found: {0}")]
    ShadowLinkNotFound(String),

    #[error("alias {0} is already taken by a live link")]
    AliasTaken(String),

    #[error("shadow link is not in a sweepable state")]
    ShadowLinkNotPaid,

    // ── Audit ────────────────────────────────────────────────────────────────
    #[error("attestation signature did not verify")]
    AttestationFailed,

    #[error("decryption challenge expired or unknown")]
    ChallengeExpired,

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Stable wire kind for the error envelope.
    pub fn kind(&self) -> &'static str {
        use GatewayError::*;
        match self {
            KeyVaultAuthFailed => "key_vault_auth_failed",
            MismatchedKey(_) => "mismatched_key",
            PoolLocked(_) => "pool_locked",
            HierarchyViolation { .. } => "hierarchy_violation",
            RootAlreadyExists(_) => "root_already_exists",
            PoolNotFound(_) => "pool_not_found",
            ForeignPool { .. } => "foreign_pool",
            InsufficientLiquidity { .. } => "insufficient_liquidity",
            RateLimited { .. } => "rate_limited",
            RecoveryPoolNotFound(_) => "recovery_pool_not_found",
            RecoveryPoolExists(_) => "recovery_pool_exists",
            LedgerRateLimited => "ledger_rate_limited",
            BlockhashExpired(_) => "blockhash_expired",
            LedgerRejected(_) => "ledger_rejected",
            Rpc(_) => "ledger_rpc_error",
            BurnerAtaMissing => "burner_ata_missing",
            InvalidAddress(_) => "invalid_address",
            InvalidSignature => "invalid_signature",
            MissingSignature(_) => "missing_signature",
            FacilitatorUnavailable(_) => "facilitator_unavailable",
            FacilitatorRejected(_) => "facilitator_rejected",
            AgentPolicyDenied(_) => "agent_policy_denied",
            AgentAuthFailed => "agent_auth_failed",
            ZeroAmount => "zero_amount",
            SessionNotFound(_) => "session_not_found",
            CancellationRefused(_) => "cancellation_refused",
            ShadowLinkExpired => "shadow_link_expired",
            ShadowLinkUsed => "shadow_link_used",
            ShadowLinkCancelled => "shadow_link_cancelled",
            ShadowLinkNotFound(_) => "shadow_link_not_found",
            AliasTaken(_) => "alias_taken",
            ShadowLinkNotPaid => "shadow_link_not_paid",
            AttestationFailed => "attestation_failed",
            ChallengeExpired => "challenge_expired",
            Serialization(_) => "serialization_error",
            Storage(_) => "storage_error",
        }
    }

    /// True for failures the ledger client may transparently retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::LedgerRateLimited | GatewayError::Rpc(_))
    }
}
