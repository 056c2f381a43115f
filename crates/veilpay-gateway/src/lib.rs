//! veilpay-gateway
//!
//! The wiring layer: an explicit `GatewayContext` owning every component, a
//! typed facade for the HTTP surface (routing itself is an external
//! collaborator), and the request throttler. The binary in `main.rs` parses
//! configuration, opens the on-disk documents, and spawns the background
//! workers.

pub mod api;
pub mod config;
pub mod context;
pub mod throttler;

pub use api::ErrorEnvelope;
pub use config::GatewayConfig;
pub use context::GatewayContext;
pub use throttler::{Admission, RequestThrottler};
