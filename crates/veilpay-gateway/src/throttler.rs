use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;

use veilpay_core::GatewayError;

/// A shared handle to one outstanding response-producing task. The payload
/// is a JSON value (possibly an error envelope), so it clones freely to
/// every waiter.
pub type SharedResponse = Shared<BoxFuture<'static, Value>>;

/// Minimum spacing between admissions of one (endpoint, caller) pair.
#[derive(Clone, Copy, Debug)]
pub struct ThrottlePolicy {
    pub min_interval: Duration,
}

/// The typed admission decision. No exceptions for control flow: a limited
/// or deduplicated request is an ordinary value.
pub enum Admission {
    Proceed,
    RateLimited { retry_after: Duration },
    InFlight { handle: SharedResponse },
}

#[derive(Default)]
struct ThrottleState {
    last_request: HashMap<String, Instant>,
    in_flight: HashMap<String, SharedResponse>,
    cache: HashMap<String, (Value, Instant)>,
}

/// Owns the dedup map, the last-request map, and the response cache, all
/// behind a single lock.
pub struct RequestThrottler {
    policies: HashMap<&'static str, ThrottlePolicy>,
    default_policy: ThrottlePolicy,
    state: Mutex<ThrottleState>,
}

impl Default for RequestThrottler {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestThrottler {
    pub fn new() -> Self {
        let mut policies = HashMap::new();
        // Settlement-bearing endpoints space wider than plain reads.
        policies.insert("pool/pay", ThrottlePolicy { min_interval: Duration::from_millis(1_000) });
        policies.insert("shadow/sweep", ThrottlePolicy { min_interval: Duration::from_millis(1_000) });
        policies.insert("audit/list", ThrottlePolicy { min_interval: Duration::from_millis(250) });
        Self {
            policies,
            default_policy: ThrottlePolicy {
                min_interval: Duration::from_millis(100),
            },
            state: Mutex::new(ThrottleState::default()),
        }
    }

    fn policy(&self, endpoint: &str) -> ThrottlePolicy {
        self.policies
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Admit or refuse one request. A live in-flight handle for the same key
    /// is returned instead of admitting a duplicate task.
    pub fn admit(&self, endpoint: &str, caller: &str) -> Admission {
        let key = format!("{endpoint}:{caller}");
        let policy = self.policy(endpoint);
        let mut state = self.state.lock().expect("throttle state poisoned");

        if let Some(handle) = state.in_flight.get(&key) {
            return Admission::InFlight {
                handle: handle.clone(),
            };
        }

        let now = Instant::now();
        if let Some(last) = state.last_request.get(&key) {
            let since = now.duration_since(*last);
            if since < policy.min_interval {
                return Admission::RateLimited {
                    retry_after: policy.min_interval - since,
                };
            }
        }
        state.last_request.insert(key, now);
        Admission::Proceed
    }

    /// Interval check only, folded into the gateway error space.
    pub fn check(&self, endpoint: &str, caller: &str) -> Result<(), GatewayError> {
        match self.admit(endpoint, caller) {
            Admission::Proceed | Admission::InFlight { .. } => Ok(()),
            Admission::RateLimited { retry_after } => Err(GatewayError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            }),
        }
    }

    /// Run `make` at most once per key: concurrent callers share the one
    /// outstanding task, and the response stays cached for `cache_ttl`.
    pub async fn dedup(
        &self,
        key: &str,
        cache_ttl: Duration,
        make: impl FnOnce() -> BoxFuture<'static, Value>,
    ) -> Value {
        let handle = {
            let mut state = self.state.lock().expect("throttle state poisoned");
            if let Some((cached, at)) = state.cache.get(key) {
                if at.elapsed() < cache_ttl {
                    return cached.clone();
                }
            }
            if let Some(handle) = state.in_flight.get(key) {
                handle.clone()
            } else {
                let handle: SharedResponse = make().shared();
                state.in_flight.insert(key.to_string(), handle.clone());
                handle
            }
        };

        let value = handle.await;

        let mut state = self.state.lock().expect("throttle state poisoned");
        state.in_flight.remove(key);
        state.cache.insert(key.to_string(), (value.clone(), Instant::now()));
        value
    }
}
