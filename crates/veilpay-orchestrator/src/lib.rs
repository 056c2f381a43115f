//! veilpay-orchestrator
//!
//! The four-phase payment state machine: provision a burner, fund it from a
//! stealth pool, settle to the recipient (directly or through the gasless
//! facilitator), then destroy the burner and recover its rent. Every failure
//! after Phase 1 schedules an idempotent rollback sweep.

pub mod orchestrator;
pub mod sweep;

pub use orchestrator::{PaymentOrchestrator, PaymentOutcome, PaymentRequest};
pub use sweep::{SweepKind, SweepQueue, SweepTask};
