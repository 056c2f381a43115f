use serde::{Deserialize, Serialize};

use crate::types::{now_ms, Address, Lamports, SessionId, TimestampMs, TokenAmount, TxSignature};

// ── Phases ───────────────────────────────────────────────────────────────────

/// The four on-chain phases of one payment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPhase {
    /// Fund the burner with rent + gas buffer and create its token account.
    Setup,
    /// Move the stablecoin amount from the pool to the burner.
    Stock,
    /// Move the amount from the burner to the recipient.
    Settle,
    /// Close the burner's token account and return residual lamports.
    Recover,
}

impl PaymentPhase {
    pub fn label(&self) -> &'static str {
        match self {
            PaymentPhase::Setup => "setup",
            PaymentPhase::Stock => "stock",
            PaymentPhase::Settle => "settle",
            PaymentPhase::Recover => "recover",
        }
    }
}

// ── Method & status ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Burner signs and pays Phase-3 gas out of its funding buffer.
    Direct,
    /// A facilitator fee payer covers Phase-3 gas.
    Gasless,
}

/// Why a session failed, by the stage that broke.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    Setup,
    Stock,
    Settle,
    Recover,
    /// Converted by the watchdog after exceeding the in-progress bound.
    Stuck,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Failed(FailStage),
    /// Phase 3 confirmed but Phase 4 did not; rent is still held.
    Partial,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed(_) | SessionStatus::Partial
        )
    }

    pub fn label(&self) -> String {
        match self {
            SessionStatus::Pending => "pending".into(),
            SessionStatus::InProgress => "in_progress".into(),
            SessionStatus::Completed => "completed".into(),
            SessionStatus::Failed(stage) => format!("failed({:?})", stage).to_lowercase(),
            SessionStatus::Partial => "partial".into(),
        }
    }
}

// ── TransactionRecord ────────────────────────────────────────────────────────

/// What the orchestrator remembers about one confirmed phase transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRecord {
    pub phase: PaymentPhase,
    pub signature: TxSignature,
    /// Network fee actually charged, read back from the parsed transaction.
    pub fee: Lamports,
    pub confirmed_at: TimestampMs,
    pub explorer_url: String,
}

// ── PaymentSession ───────────────────────────────────────────────────────────

/// In-memory record of one payment's lifecycle. Owned by the orchestrator
/// task while live; sealed into the audit log at a terminal state, after
/// which the plaintext copy is discarded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentSession {
    pub session_id: SessionId,
    pub owner_address: Address,
    pub pool_address: Address,
    pub burner_public_key: Address,
    pub recipient_address: Address,
    pub amount: TokenAmount,
    pub method: PaymentMethod,
    pub status: SessionStatus,
    pub transactions: Vec<TransactionRecord>,
    /// Total lamports the pool laid out: burner funding, token-account
    /// rent, and the fees it paid in phases 1 and 2.
    pub sol_funded: Lamports,
    /// Lamports recovered at Phase 4 (rent + residual buffer).
    pub sol_recovered: Lamports,
    pub created_at: TimestampMs,
    pub finished_at: Option<TimestampMs>,
    /// Wall-clock life of the burner, set when the session terminates.
    pub burner_lifespan_ms: Option<i64>,
}

impl PaymentSession {
    pub fn new(
        owner_address: Address,
        pool_address: Address,
        burner_public_key: Address,
        recipient_address: Address,
        amount: TokenAmount,
        method: PaymentMethod,
    ) -> Self {
        Self {
            session_id: SessionId::generate(),
            owner_address,
            pool_address,
            burner_public_key,
            recipient_address,
            amount,
            method,
            status: SessionStatus::Pending,
            transactions: Vec::new(),
            sol_funded: 0,
            sol_recovered: 0,
            created_at: now_ms(),
            finished_at: None,
            burner_lifespan_ms: None,
        }
    }

    pub fn record_phase(&mut self, record: TransactionRecord) {
        self.transactions.push(record);
    }

    pub fn phase_record(&self, phase: PaymentPhase) -> Option<&TransactionRecord> {
        self.transactions.iter().find(|r| r.phase == phase)
    }

    /// Sum of observed network fees across recorded phases.
    pub fn total_fees(&self) -> Lamports {
        self.transactions.iter().map(|r| r.fee).sum()
    }

    /// Net lamport cost of the payment: what went in minus what came back.
    pub fn net_cost(&self) -> Lamports {
        self.sol_funded.saturating_sub(self.sol_recovered)
    }

    /// Move to a terminal state and stamp the lifespan.
    pub fn finish(&mut self, status: SessionStatus) {
        debug_assert!(status.is_terminal());
        let now = now_ms();
        self.status = status;
        self.finished_at = Some(now);
        self.burner_lifespan_ms = Some(now - self.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PaymentSession {
        PaymentSession::new(
            Address::from_bytes([1; 32]),
            Address::from_bytes([2; 32]),
            Address::from_bytes([3; 32]),
            Address::from_bytes([4; 32]),
            70_000,
            PaymentMethod::Gasless,
        )
    }

    #[test]
    fn net_cost_never_underflows() {
        let mut s = session();
        s.sol_funded = 10;
        s.sol_recovered = 25;
        assert_eq!(s.net_cost(), 0);
    }

    #[test]
    fn finish_stamps_lifespan_and_terminal_state() {
        let mut s = session();
        s.finish(SessionStatus::Completed);
        assert!(s.status.is_terminal());
        assert!(s.finished_at.is_some());
        assert!(s.burner_lifespan_ms.unwrap() >= 0);
    }

    #[test]
    fn fee_sum_covers_all_phases() {
        let mut s = session();
        for (phase, fee) in [
            (PaymentPhase::Setup, 5_000),
            (PaymentPhase::Stock, 5_000),
            (PaymentPhase::Recover, 5_000),
        ] {
            s.record_phase(TransactionRecord {
                phase,
                signature: TxSignature::from_bytes([9; 64]),
                fee,
                confirmed_at: 0,
                explorer_url: String::new(),
            });
        }
        assert_eq!(s.total_fees(), 15_000);
        assert!(s.phase_record(PaymentPhase::Settle).is_none());
    }
}
