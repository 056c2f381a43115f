use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use veilpay_audit::AuditLogger;
use veilpay_facilitator::{FacilitatorAdapter, FacilitatorHttp};
use veilpay_ledger::{LedgerClient, RpcTransport};
use veilpay_orchestrator::{PaymentOrchestrator, SweepQueue};
use veilpay_policy::{AgentPolicy, AgentRegistry};
use veilpay_pools::{PoolRegistry, StealthPool};
use veilpay_recovery::{RecoveryPool, RecoveryRegistry};
use veilpay_shadow::{ShadowEngine, ShadowLink};
use veilpay_state::DocumentStore;

use veilpay_core::GatewayError;

use crate::config::GatewayConfig;
use crate::throttler::RequestThrottler;

/// Every component, held explicitly. Handed (as an `Arc`) to whatever
/// transport wrapper fronts the gateway; there are no process-wide
/// singletons to reach for.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub ledger: Arc<LedgerClient>,
    pub facilitator: Arc<FacilitatorAdapter>,
    pub pools: Arc<PoolRegistry>,
    pub recovery: Arc<RecoveryRegistry>,
    pub shadow: Arc<ShadowEngine>,
    pub audit: Arc<AuditLogger>,
    pub agents: Arc<AgentRegistry>,
    pub sweeps: Arc<SweepQueue>,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub throttler: RequestThrottler,

    pool_store: Arc<DocumentStore<StealthPool>>,
    recovery_store: Arc<DocumentStore<RecoveryPool>>,
    link_store: Arc<DocumentStore<ShadowLink>>,
    agent_store: Arc<DocumentStore<AgentPolicy>>,
}

impl GatewayContext {
    /// Wire the whole gateway over the given transports. Documents load (or
    /// initialize) under the configured data dir.
    pub fn open(
        config: GatewayConfig,
        transport: Arc<dyn RpcTransport>,
        facilitator_http: Box<dyn FacilitatorHttp>,
    ) -> Result<Arc<Self>, GatewayError> {
        let ledger = Arc::new(LedgerClient::new(transport, &config.explorer_base));
        let facilitator = Arc::new(FacilitatorAdapter::new(facilitator_http, &config.network));

        let pool_store = DocumentStore::load(config.pools_path())?;
        let recovery_store = DocumentStore::load(config.recovery_path())?;
        let link_store = DocumentStore::load(config.links_path())?;
        let agent_store = DocumentStore::load(config.agents_path())?;

        let pools = Arc::new(PoolRegistry::new(Arc::clone(&pool_store)));
        let recovery = Arc::new(RecoveryRegistry::new(
            Arc::clone(&recovery_store),
            Arc::clone(&ledger),
        ));
        let shadow = Arc::new(ShadowEngine::new(
            Arc::clone(&link_store),
            Arc::clone(&ledger),
            config.mint,
            config.token_decimals,
        ));
        let audit = Arc::new(AuditLogger::new());
        let agents = Arc::new(AgentRegistry::new(Arc::clone(&agent_store)));
        let sweeps = Arc::new(SweepQueue::new(
            Arc::clone(&ledger),
            Arc::clone(&recovery),
            config.mint,
            config.token_decimals,
        ));
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            Arc::clone(&ledger),
            Arc::clone(&facilitator),
            Arc::clone(&pools),
            Arc::clone(&recovery),
            Arc::clone(&audit),
            Arc::clone(&agents),
            Arc::clone(&sweeps),
            config.mint,
            config.token_decimals,
        ));

        info!(
            pools = pool_store.len(),
            links = link_store.len(),
            agents = agent_store.len(),
            "gateway context ready"
        );
        Ok(Arc::new(Self {
            config,
            ledger,
            facilitator,
            pools,
            recovery,
            shadow,
            audit,
            agents,
            sweeps,
            orchestrator,
            throttler: RequestThrottler::new(),
            pool_store,
            recovery_store,
            link_store,
            agent_store,
        }))
    }

    /// Spawn the long-lived background workers: the sweep drainer and the
    /// shadow-link expiry tick.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(Arc::clone(&self.sweeps).run()));

        let shadow = Arc::clone(&self.shadow);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let expired = shadow.expire_due();
                if expired > 0 {
                    info!(expired, "shadow links expired");
                }
            }
        }));

        handles
    }

    /// Push every document to disk; called on shutdown.
    pub fn flush_all(&self) {
        for (name, result) in [
            ("pools", self.pool_store.flush_now()),
            ("recovery", self.recovery_store.flush_now()),
            ("links", self.link_store.flush_now()),
            ("agents", self.agent_store.flush_now()),
        ] {
            if let Err(e) = result {
                warn!(document = name, "flush on shutdown failed: {e}");
            }
        }
    }
}
