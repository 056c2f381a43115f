//! veilpay-ledger
//!
//! The gateway's view of the ledger: a typed instruction/transaction model
//! covering the narrow set of primitives the orchestrator needs, and a
//! JSON-RPC client with bounded-backoff reads and strict confirmation
//! against `last_valid_block_height`.

pub mod client;
pub mod rpc;
pub mod tx;

pub use client::{LedgerClient, ParsedInstruction, ParsedTransaction, TokenBalance};
pub use rpc::{HttpTransport, RpcTransport};
pub use tx::{derive_token_account, InstructionKind, LedgerTransaction};
