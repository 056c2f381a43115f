//! ─── Veilpay Gateway Constants ──────────────────────────────────────────────
//!
//! Fixed protocol knobs. Anything the ledger prices (rent-exempt minimums,
//! base transaction fees) is queried at run time and never appears here.

// ── Liquidity & reservations ─────────────────────────────────────────────────

/// Lamports a recovery pool must retain after all outstanding reservations.
pub const MIN_LIQUIDITY_LAMPORTS: u64 = 5_000_000;

/// A liquidity reservation not released within this window expires.
pub const RESERVATION_TTL_SECS: u64 = 60;

/// Settlement-bearing operations allowed per owner per rolling window.
pub const OWNER_RATE_LIMIT_MAX: usize = 5;

/// Width of the per-owner rate-limit window.
pub const OWNER_RATE_WINDOW_SECS: u64 = 60;

// ── Orchestration timing ─────────────────────────────────────────────────────

/// Wait after Phase 2 confirmation before verifying the burner token account,
/// giving the facilitator's RPC view time to catch up.
pub const PROPAGATION_WAIT_MS: u64 = 2_000;

/// Post-stock verification retries; delays grow 1 s, 2 s, 3 s.
pub const VERIFY_RETRY_ATTEMPTS: u32 = 3;

/// Read retries for ledger RPC calls (rate-limit / transient failures).
pub const READ_RETRY_ATTEMPTS: u32 = 3;

/// Initial read-retry delay; doubles per attempt.
pub const READ_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Confirmation poll interval.
pub const CONFIRM_POLL_MS: u64 = 500;

/// A session still in progress past this bound is failed and swept.
pub const SESSION_WATCHDOG_SECS: u64 = 600;

/// Minimum spacing between Phase-4 retries for a `partial` session's burner.
pub const PARTIAL_RETRY_INTERVAL_SECS: u64 = 300;

// ── Facilitator ──────────────────────────────────────────────────────────────

/// Cached fee-payer discovery lives this long.
pub const FEE_PAYER_CACHE_TTL_SECS: u64 = 300;

/// Facilitator calls past this bound count as unavailable.
pub const FACILITATOR_TIMEOUT_SECS: u64 = 30;

/// A failed probe within this window disables the gasless path.
pub const FACILITATOR_HEALTH_WINDOW_SECS: u64 = 120;

// ── Ledger account sizes ─────────────────────────────────────────────────────

/// Serialized size of a token account, used for rent-exemption queries.
pub const TOKEN_ACCOUNT_LEN: u64 = 165;

// ── Persistence ──────────────────────────────────────────────────────────────

/// Document writes are debounced by this much before the atomic replace.
pub const PERSIST_DEBOUNCE_MS: u64 = 500;

/// Version tag written into every on-disk document.
pub const SCHEMA_VERSION: u32 = 1;

// ── Audit ────────────────────────────────────────────────────────────────────

/// Sealed sessions retained per owner; oldest evicted beyond this.
pub const AUDIT_LOG_CAP: usize = 50;

/// Decryption challenges expire after this long.
pub const CHALLENGE_TTL_SECS: u64 = 120;

// ── Shadow links ─────────────────────────────────────────────────────────────

/// An alias may be reissued only this long after its link reached a
/// terminal state.
pub const ALIAS_RETENTION_SECS: u64 = 86_400;

// ── Agents ───────────────────────────────────────────────────────────────────

/// Failed authentications before an agent key is put on cooldown.
pub const AGENT_AUTH_MAX_FAILURES: u32 = 5;

/// Cooldown applied after repeated failed authentications.
pub const AGENT_KEY_COOLDOWN_SECS: u64 = 60;

/// Width of the rolling agent spend window.
pub const AGENT_SPEND_WINDOW_SECS: u64 = 86_400;
