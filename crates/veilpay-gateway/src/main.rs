//! veilpay-gateway — the gateway daemon.
//!
//! Startup sequence:
//!   1. Load configuration (CLI flags, or a JSON config file)
//!   2. Open (or initialise) the state documents under the data dir
//!   3. Wire the components into a GatewayContext
//!   4. Spawn the background workers: sweep drainer, shadow expiry tick
//!   5. Run until interrupted, then flush all documents

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use veilpay_core::types::Address;
use veilpay_facilitator::HttpFacilitator;
use veilpay_gateway::{GatewayConfig, GatewayContext};
use veilpay_ledger::HttpTransport;

#[derive(Parser, Debug)]
#[command(
    name = "veilpay-gateway",
    version,
    about = "veilpay — privacy-preserving stablecoin payment gateway"
)]
struct Args {
    /// Directory for the persistent state documents.
    #[arg(long, default_value = "~/.veilpay/data")]
    data_dir: PathBuf,

    /// Ledger JSON-RPC endpoint.
    #[arg(long, default_value = "http://127.0.0.1:8899")]
    rpc_url: String,

    /// Explorer base URL for transaction links.
    #[arg(long, default_value = "https://explorer.example")]
    explorer: String,

    /// Facilitator base URL.
    #[arg(long, default_value = "http://127.0.0.1:4020")]
    facilitator_url: String,

    /// Network tag used in facilitator payloads.
    #[arg(long, default_value = "mainnet")]
    network: String,

    /// Stablecoin mint address (base-58).
    #[arg(long)]
    mint: Option<String>,

    /// Stablecoin decimals.
    #[arg(long, default_value_t = 6)]
    decimals: u8,

    /// Path to a JSON config file; overrides every flag above.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        return serde_json::from_str(&raw).context("parsing config file");
    }

    let mint = args
        .mint
        .as_deref()
        .context("--mint is required unless --config is given")?;
    Ok(GatewayConfig {
        data_dir: expand_tilde(&args.data_dir),
        ledger_rpc_url: args.rpc_url.clone(),
        explorer_base: args.explorer.clone(),
        facilitator_url: args.facilitator_url.clone(),
        network: args.network.clone(),
        mint: Address::from_b58(mint).context("parsing --mint")?,
        token_decimals: args.decimals,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,veilpay=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("veilpay gateway starting");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let transport = Arc::new(HttpTransport::new(&config.ledger_rpc_url));
    let facilitator = Box::new(HttpFacilitator::new(&config.facilitator_url));

    let context =
        GatewayContext::open(config, transport, facilitator).context("wiring gateway context")?;
    let workers = context.spawn_workers();
    info!("gateway ready; workers running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    for handle in workers {
        handle.abort();
    }
    context.flush_all();
    Ok(())
}

fn expand_tilde(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
