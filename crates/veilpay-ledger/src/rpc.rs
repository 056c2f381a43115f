use async_trait::async_trait;
use serde_json::Value;

use veilpay_core::GatewayError;

/// Transport seam under the ledger client: one JSON-RPC call out, one
/// `result` value back. Production uses [`HttpTransport`]; tests substitute
/// canned responses.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError>;
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Rpc(format!("connecting to ledger at {}: {e}", self.url)))?;

        if resp.status().as_u16() == 429 {
            return Err(GatewayError::LedgerRateLimited);
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Rpc(format!("parsing RPC response: {e}")))?;

        if let Some(err) = json.get("error") {
            let msg = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC error");
            if err.get("code").and_then(Value::as_i64) == Some(429)
                || msg.to_ascii_lowercase().contains("rate limit")
            {
                return Err(GatewayError::LedgerRateLimited);
            }
            return Err(GatewayError::Rpc(msg.to_string()));
        }

        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }
}
