use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use veilpay_core::types::Address;

/// Everything the gateway needs to come up. Populated from CLI flags, or
/// wholesale from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Directory holding the three state documents.
    pub data_dir: PathBuf,
    /// Ledger JSON-RPC endpoint.
    pub ledger_rpc_url: String,
    /// Base URL for explorer links in transaction records.
    pub explorer_base: String,
    /// Facilitator base URL (`/supported`, `/settle`).
    pub facilitator_url: String,
    /// Network tag used in facilitator payloads.
    pub network: String,
    /// The stablecoin mint.
    pub mint: Address,
    pub token_decimals: u8,
}

impl GatewayConfig {
    pub fn pools_path(&self) -> PathBuf {
        self.data_dir.join("pools.json")
    }

    pub fn links_path(&self) -> PathBuf {
        self.data_dir.join("links.json")
    }

    pub fn agents_path(&self) -> PathBuf {
        self.data_dir.join("agents.json")
    }

    pub fn recovery_path(&self) -> PathBuf {
        self.data_dir.join("recovery.json")
    }
}
