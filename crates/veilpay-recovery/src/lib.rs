//! veilpay-recovery
//!
//! The per-owner recovery pool: the fee payer that breaks the on-chain link
//! between a stealth pool and its recipient, the destination for recycled
//! burner rent, and the ledger of soft liquidity reservations that keeps
//! concurrent payments from over-committing it.

pub mod pool;
pub mod registry;

pub use pool::{RecoveryPool, RecoveryStatus};
pub use registry::RecoveryRegistry;
