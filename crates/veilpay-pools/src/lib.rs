//! veilpay-pools
//!
//! The stealth pool registry: custodial ephemeral pools whose signing keys
//! live encrypted at rest and decrypt only against a fresh owner signature.
//! Enforces the three-level funding hierarchy (ROOT → INTERMEDIATE → LEAF).

pub mod pool;
pub mod registry;

pub use pool::{PoolStatus, PoolType, StealthPool};
pub use registry::{validate_funding_edge, PoolRegistry};
