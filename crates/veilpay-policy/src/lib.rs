//! veilpay-policy
//!
//! Agent registry and spend policy. API keys exist in plaintext exactly once,
//! at creation; only blake3 digests are stored. Policy checks run before any
//! liquidity is touched.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use veilpay_core::constants::{
    AGENT_AUTH_MAX_FAILURES, AGENT_KEY_COOLDOWN_SECS, AGENT_SPEND_WINDOW_SECS,
};
use veilpay_core::types::{now_ms, Address, AgentId, TimestampMs, TokenAmount};
use veilpay_core::GatewayError;
use veilpay_state::DocumentStore;

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Paused,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpendEntry {
    pub at_ms: TimestampMs,
    pub amount: TokenAmount,
}

/// One registered agent. `api_key_hash` is a blake3 digest; the key itself
/// is never stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub agent_id: AgentId,
    pub owner_address: Address,
    pub api_key_hash: String,
    pub status: AgentStatus,
    pub max_per_tx: TokenAmount,
    pub daily_limit: TokenAmount,
    pub allowed_resources: BTreeSet<String>,
    /// Spends inside the rolling window; pruned on every check.
    pub recent_spend: Vec<SpendEntry>,
    pub total_spent: TokenAmount,
    pub created_at: TimestampMs,
}

impl AgentPolicy {
    /// Spend inside the rolling 24-hour window as of `now`.
    pub fn spent_24h(&self, now: TimestampMs) -> TokenAmount {
        let cutoff = now - (AGENT_SPEND_WINDOW_SECS as i64) * 1_000;
        self.recent_spend
            .iter()
            .filter(|e| e.at_ms >= cutoff)
            .map(|e| e.amount)
            .sum()
    }
}

fn hash_key(api_key: &str) -> String {
    hex::encode(blake3::hash(api_key.as_bytes()).as_bytes())
}

fn fresh_key() -> String {
    let mut b = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut b);
    format!("vp_{}", bs58::encode(b).into_string())
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct AuthFailures {
    count: u32,
    cooldown_until: Option<Instant>,
}

pub struct AgentRegistry {
    store: Arc<DocumentStore<AgentPolicy>>,
    /// Failed-auth counters keyed by the presented key's digest.
    failures: Mutex<HashMap<String, AuthFailures>>,
}

impl AgentRegistry {
    pub fn new(store: Arc<DocumentStore<AgentPolicy>>) -> Self {
        Self {
            store,
            failures: Mutex::new(HashMap::new()),
        }
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    /// Register an agent. The returned plaintext key is shown exactly once.
    pub fn create_agent(
        &self,
        owner: &Address,
        max_per_tx: TokenAmount,
        daily_limit: TokenAmount,
        allowed_resources: BTreeSet<String>,
    ) -> (AgentPolicy, String) {
        let key = fresh_key();
        let agent = AgentPolicy {
            agent_id: AgentId::generate(),
            owner_address: *owner,
            api_key_hash: hash_key(&key),
            status: AgentStatus::Active,
            max_per_tx,
            daily_limit,
            allowed_resources,
            recent_spend: Vec::new(),
            total_spent: 0,
            created_at: now_ms(),
        };
        self.store.insert(agent.agent_id.to_string(), agent.clone());
        info!(agent = %agent.agent_id, owner = %owner, "agent registered");
        (agent, key)
    }

    /// Swap in a fresh key; the previous digest stops authenticating.
    pub fn regenerate_key(&self, agent_id: &AgentId) -> Result<String, GatewayError> {
        let key = fresh_key();
        let hash = hash_key(&key);
        self.store.modify(|records| match records.get_mut(agent_id.as_str()) {
            Some(agent) => {
                agent.api_key_hash = hash;
                Ok(())
            }
            None => Err(GatewayError::AgentAuthFailed),
        })?;
        Ok(key)
    }

    /// Resolve an API key to its agent. Repeated misses put the presented
    /// digest on cooldown.
    pub fn authenticate(&self, api_key: &str) -> Result<AgentPolicy, GatewayError> {
        let digest = hash_key(api_key);

        {
            let mut failures = self.failures.lock().expect("failure map poisoned");
            if let Some(state) = failures.get_mut(&digest) {
                if let Some(until) = state.cooldown_until {
                    if Instant::now() < until {
                        return Err(GatewayError::RateLimited {
                            retry_after_secs: (until - Instant::now()).as_secs().max(1),
                        });
                    }
                    state.cooldown_until = None;
                    state.count = 0;
                }
            }
        }

        let found = self
            .store
            .all()
            .into_iter()
            .map(|(_, a)| a)
            .find(|a| a.api_key_hash == digest);

        match found {
            Some(agent) => {
                self.failures.lock().expect("failure map poisoned").remove(&digest);
                Ok(agent)
            }
            None => {
                let mut failures = self.failures.lock().expect("failure map poisoned");
                let state = failures.entry(digest).or_default();
                state.count += 1;
                if state.count >= AGENT_AUTH_MAX_FAILURES {
                    state.cooldown_until = Some(
                        Instant::now() + std::time::Duration::from_secs(AGENT_KEY_COOLDOWN_SECS),
                    );
                    warn!("api key digest placed on auth cooldown");
                }
                Err(GatewayError::AgentAuthFailed)
            }
        }
    }

    // ── Policy ───────────────────────────────────────────────────────────────

    pub fn get(&self, agent_id: &AgentId) -> Result<AgentPolicy, GatewayError> {
        self.store
            .get(agent_id.as_str())
            .ok_or(GatewayError::AgentAuthFailed)
    }

    pub fn set_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<(), GatewayError> {
        self.store.modify(|records| match records.get_mut(agent_id.as_str()) {
            Some(agent) => {
                agent.status = status;
                Ok(())
            }
            None => Err(GatewayError::AgentAuthFailed),
        })
    }

    /// Enforce the agent's policy against one prospective payment. Runs
    /// strictly before liquidity reservation.
    pub fn check(
        &self,
        agent_id: &AgentId,
        resource: &str,
        amount: TokenAmount,
    ) -> Result<(), GatewayError> {
        let now = now_ms();
        self.store.modify(|records| {
            let agent = records
                .get_mut(agent_id.as_str())
                .ok_or(GatewayError::AgentAuthFailed)?;

            if agent.status == AgentStatus::Paused {
                return Err(GatewayError::AgentPolicyDenied("agent is paused".into()));
            }
            if !agent.allowed_resources.contains(resource) {
                return Err(GatewayError::AgentPolicyDenied(format!(
                    "resource {resource} not permitted"
                )));
            }
            if amount > agent.max_per_tx {
                return Err(GatewayError::AgentPolicyDenied(format!(
                    "amount exceeds per-transaction limit of {}",
                    agent.max_per_tx
                )));
            }

            let cutoff = now - (AGENT_SPEND_WINDOW_SECS as i64) * 1_000;
            agent.recent_spend.retain(|e| e.at_ms >= cutoff);
            let spent = agent.spent_24h(now);
            if spent + amount > agent.daily_limit {
                return Err(GatewayError::AgentPolicyDenied(format!(
                    "daily limit exhausted ({spent} of {} spent)",
                    agent.daily_limit
                )));
            }
            Ok(())
        })
    }

    pub fn record_spend(&self, agent_id: &AgentId, amount: TokenAmount) -> Result<(), GatewayError> {
        self.store.modify(|records| match records.get_mut(agent_id.as_str()) {
            Some(agent) => {
                agent.recent_spend.push(SpendEntry {
                    at_ms: now_ms(),
                    amount,
                });
                agent.total_spent += amount;
                Ok(())
            }
            None => Err(GatewayError::AgentAuthFailed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (AgentRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::load(dir.path().join("agents.json")).unwrap();
        (AgentRegistry::new(store), dir)
    }

    fn owner() -> Address {
        Address::from_bytes([1; 32])
    }

    fn resources() -> BTreeSet<String> {
        ["pool/pay".to_string()].into_iter().collect()
    }

    #[tokio::test]
    async fn key_round_trip_and_single_plaintext() {
        let (reg, _dir) = registry();
        let (agent, key) = reg.create_agent(&owner(), 100, 1_000, resources());
        assert!(key.starts_with("vp_"));
        assert_ne!(agent.api_key_hash, key);

        let found = reg.authenticate(&key).unwrap();
        assert_eq!(found.agent_id, agent.agent_id);
    }

    #[tokio::test]
    async fn regeneration_invalidates_prior_key() {
        let (reg, _dir) = registry();
        let (agent, old_key) = reg.create_agent(&owner(), 100, 1_000, resources());
        let new_key = reg.regenerate_key(&agent.agent_id).unwrap();

        assert!(reg.authenticate(&old_key).is_err());
        assert_eq!(reg.authenticate(&new_key).unwrap().agent_id, agent.agent_id);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_misses_trip_cooldown() {
        let (reg, _dir) = registry();
        for _ in 0..AGENT_AUTH_MAX_FAILURES {
            assert!(matches!(
                reg.authenticate("vp_bogus").unwrap_err(),
                GatewayError::AgentAuthFailed
            ));
        }
        assert!(matches!(
            reg.authenticate("vp_bogus").unwrap_err(),
            GatewayError::RateLimited { .. }
        ));

        tokio::time::advance(std::time::Duration::from_secs(AGENT_KEY_COOLDOWN_SECS + 1)).await;
        assert!(matches!(
            reg.authenticate("vp_bogus").unwrap_err(),
            GatewayError::AgentAuthFailed
        ));
    }

    #[tokio::test]
    async fn paused_agent_is_refused() {
        let (reg, _dir) = registry();
        let (agent, _) = reg.create_agent(&owner(), 100, 1_000, resources());
        reg.set_status(&agent.agent_id, AgentStatus::Paused).unwrap();
        let err = reg.check(&agent.agent_id, "pool/pay", 1).unwrap_err();
        assert!(matches!(err, GatewayError::AgentPolicyDenied(_)));
    }

    #[tokio::test]
    async fn per_tx_and_resource_limits() {
        let (reg, _dir) = registry();
        let (agent, _) = reg.create_agent(&owner(), 100, 1_000, resources());

        assert!(reg.check(&agent.agent_id, "pool/pay", 100).is_ok());
        assert!(reg.check(&agent.agent_id, "pool/pay", 101).is_err());
        assert!(reg.check(&agent.agent_id, "shadow/create", 1).is_err());
    }

    #[tokio::test]
    async fn rolling_window_forgets_old_spend() {
        let (reg, _dir) = registry();
        let (agent, _) = reg.create_agent(&owner(), 1_000, 1_000, resources());

        reg.record_spend(&agent.agent_id, 900).unwrap();
        assert!(reg.check(&agent.agent_id, "pool/pay", 200).is_err());
        assert!(reg.check(&agent.agent_id, "pool/pay", 100).is_ok());

        // Age the spend out of the window.
        reg.store.modify(|records| {
            let a = records.get_mut(agent.agent_id.as_str()).unwrap();
            for e in &mut a.recent_spend {
                e.at_ms -= (AGENT_SPEND_WINDOW_SECS as i64) * 1_000 + 1_000;
            }
        });
        assert!(reg.check(&agent.agent_id, "pool/pay", 200).is_ok());
        assert_eq!(reg.get(&agent.agent_id).unwrap().total_spent, 900);
    }
}
