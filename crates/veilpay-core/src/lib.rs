//! veilpay-core
//!
//! Shared types for the veilpay payment gateway: ledger addresses and
//! signatures, identifier newtypes, the in-memory payment session model,
//! protocol constants, and the gateway-wide error taxonomy.

pub mod constants;
pub mod error;
pub mod session;
pub mod types;

pub use error::GatewayError;
pub use session::{
    FailStage, PaymentMethod, PaymentPhase, PaymentSession, SessionStatus, TransactionRecord,
};
pub use types::{
    now_ms, Address, AgentId, Lamports, LinkId, PoolId, RecentBlockhash, SessionId, TimestampMs,
    TokenAmount, TxSignature,
};
