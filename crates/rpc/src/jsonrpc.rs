//! Minimal JSON-RPC over HTTP transport.

use crate::RpcError;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};

/// Per-call knobs.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub timeout: Duration,
    /// Total attempts; only timeouts are retried.
    pub attempts: u32,
}

impl CallOptions {
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            attempts: 1,
        }
    }

    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// HTTP JSON-RPC client bound to one base URL.
#[derive(Clone)]
pub struct JsonRpcClient {
    base_url: String,
    client: Client,
    auth: Option<(String, String)>,
}

impl JsonRpcClient {
    /// Create a client for `base_url`, optionally routing through an HTTP
    /// proxy.
    pub fn new(base_url: impl Into<String>, proxy: Option<&str>) -> Result<Self, RpcError> {
        let mut builder = Client::builder();
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::http(proxy)?);
        }
        Ok(Self {
            base_url: base_url.into(),
            client: builder.build()?,
            auth: None,
        })
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Invoke `method` at `path` and return its `result` (null when absent).
    pub async fn call(
        &self,
        path: &str,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        let mut request = json!({
            "jsonrpc": "2.0",
            "id": "1",
            "method": method,
        });
        if !params.is_null() {
            request["params"] = params;
        }

        for attempt in 1..=options.attempts.max(1) {
            let mut builder = self
                .client
                .post(self.url(path))
                .json(&request)
                .timeout(options.timeout);
            if let Some((user, password)) = &self.auth {
                builder = builder.basic_auth(user, Some(password));
            }

            trace!(url = %self.url(path), method, attempt, "JSON-RPC request");
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    debug!(method, attempt, "JSON-RPC call timed out");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            };
            return into_result(method, body);
        }

        Err(RpcError::Timeout(method.to_string()))
    }

    /// Plain GET returning the JSON body.
    pub async fn get(&self, path: &str, timeout: Duration) -> Result<Value, RpcError> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| timeout_or_http(path, e))?;
        response
            .error_for_status()?
            .json()
            .await
            .map_err(|e| timeout_or_http(path, e))
    }
}

fn timeout_or_http(what: &str, e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout(what.to_string())
    } else {
        RpcError::Http(e)
    }
}

/// Extract `result` from a JSON-RPC response body, surfacing a non-null
/// `error` as [`RpcError::Remote`].
pub(crate) fn into_result(method: &str, mut body: Value) -> Result<Value, RpcError> {
    match body.get("error") {
        None | Some(Value::Null) => {}
        Some(error) => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RpcError::Remote {
                method: method.to_string(),
                message,
            });
        }
    }
    Ok(body
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_extraction() {
        let body = json!({ "result": 101, "error": null, "id": "1" });
        assert_eq!(into_result("getblockcount", body).unwrap(), json!(101));

        let body = json!({ "jsonrpc": "2.0", "id": "1" });
        assert_eq!(into_result("stopcoinjoin", body).unwrap(), Value::Null);
    }

    #[test]
    fn test_remote_error() {
        let body = json!({ "error": { "code": -18, "message": "Wallet file not found" } });
        let err = into_result("getwalletinfo", body).unwrap_err();
        assert!(
            matches!(err, RpcError::Remote { ref message, .. } if message == "Wallet file not found")
        );

        let body = json!({ "error": "boom" });
        assert!(matches!(
            into_result("send", body),
            Err(RpcError::Remote { .. })
        ));
    }

    #[test]
    fn test_call_options() {
        let options = CallOptions::new(Duration::from_secs(10)).with_attempts(3);
        assert_eq!(options.attempts, 3);
        assert_eq!(CallOptions::default().timeout, Duration::from_secs(5));
    }
}
