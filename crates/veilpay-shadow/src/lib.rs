//! veilpay-shadow
//!
//! Shadow links: single-use payment invoices backed by an ephemeral stealth
//! address. A link waits for funds, flips to paid, and self-destructs when
//! the owner sweeps it into a destination pool; after that the stealth
//! secret can never be produced again.

pub mod engine;
pub mod link;

pub use engine::ShadowEngine;
pub use link::{LinkStatus, ShadowLink};
