// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Thin aria2 JSON-RPC client.
//!
//! Every call is a POST to `http://<host>:<port>/jsonrpc` with the secret
//! passed as the first positional parameter:
//!
//! ```text
//! {"jsonrpc":"2.0","id":"dlmgr-1","method":"aria2.addUri",
//!  "params":["token:<secret>", ["<url>"], {"dir": "..."}]}
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RpcError;

/// Timeout for the health probe (`aria2.getVersion`).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for every other call.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys requested from `tellStatus` / `tellActive`.
pub const STATUS_KEYS: [&str; 7] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
];

/// Raw download status. aria2 reports every number as a decimal string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2Status {
    #[serde(default)]
    pub gid: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total_length: Option<String>,
    #[serde(default)]
    pub completed_length: Option<String>,
    #[serde(default)]
    pub download_speed: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Build a JSON-RPC 2.0 request body with the secret token prepended.
pub fn request_body(id: &str, method: &str, secret: &str, params: Vec<Value>) -> Value {
    let mut all = Vec::with_capacity(params.len() + 1);
    all.push(Value::String(format!("token:{}", secret)));
    all.extend(params);
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": all,
    })
}

/// Client bound to one RPC port.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::blocking::Client,
    url: String,
    port: u16,
    secret: String,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(host: &str, port: u16, secret: &str) -> Self {
        // aria2 only listens on loopback; never route through a proxy
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(PROBE_TIMEOUT)
            .no_proxy()
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::blocking::Client::new()
            });

        Self {
            client,
            url: format!("http://{}:{}/jsonrpc", host, port),
            port,
            secret: secret.to_string(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn call(&self, method: &str, params: Vec<Value>, timeout: Duration) -> Result<Value, RpcError> {
        let id = format!("dlmgr-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let body = request_body(&id, method, &self.secret, params);

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|source| RpcError::Transport {
                method: method.to_string(),
                source,
            })?;

        let status = response.status();
        let text = response.text().map_err(|source| RpcError::Transport {
            method: method.to_string(),
            source,
        })?;

        // aria2 answers RPC-level errors (bad token, unknown GID) with a
        // JSON error object, often alongside HTTP 400
        let parsed: Option<Value> = serde_json::from_str(&text).ok();
        if let Some(err) = parsed.as_ref().and_then(|v| v.get("error")) {
            return Err(RpcError::Remote {
                method: method.to_string(),
                code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        if !status.is_success() {
            return Err(RpcError::Http {
                method: method.to_string(),
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }

        match parsed.and_then(|mut v| v.get_mut("result").map(Value::take)) {
            Some(result) => Ok(result),
            None => Err(RpcError::Decode {
                method: method.to_string(),
                detail: "response has neither result nor error".to_string(),
            }),
        }
    }

    /// `aria2.getVersion` with the short probe timeout.
    pub fn get_version(&self) -> Result<String, RpcError> {
        let result = self.call("aria2.getVersion", Vec::new(), PROBE_TIMEOUT)?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// `aria2.addUri`; returns the GID.
    pub fn add_uri(&self, url: &str, options: Map<String, Value>) -> Result<String, RpcError> {
        let method = "aria2.addUri";
        let result = self.call(
            method,
            vec![json!([url]), Value::Object(options)],
            CALL_TIMEOUT,
        )?;
        expect_gid(method, result)
    }

    pub fn tell_status(&self, gid: &str) -> Result<Aria2Status, RpcError> {
        let method = "aria2.tellStatus";
        let result = self.call(method, vec![json!(gid), json!(STATUS_KEYS)], CALL_TIMEOUT)?;
        decode(method, result)
    }

    pub fn tell_active(&self) -> Result<Vec<Aria2Status>, RpcError> {
        let method = "aria2.tellActive";
        let result = self.call(method, vec![json!(STATUS_KEYS)], CALL_TIMEOUT)?;
        decode(method, result)
    }

    pub fn pause(&self, gid: &str) -> Result<(), RpcError> {
        let method = "aria2.pause";
        expect_gid(method, self.call(method, vec![json!(gid)], CALL_TIMEOUT)?).map(|_| ())
    }

    pub fn unpause(&self, gid: &str) -> Result<(), RpcError> {
        let method = "aria2.unpause";
        expect_gid(method, self.call(method, vec![json!(gid)], CALL_TIMEOUT)?).map(|_| ())
    }

    pub fn remove(&self, gid: &str) -> Result<(), RpcError> {
        let method = "aria2.remove";
        expect_gid(method, self.call(method, vec![json!(gid)], CALL_TIMEOUT)?).map(|_| ())
    }
}

fn expect_gid(method: &str, result: Value) -> Result<String, RpcError> {
    match result {
        Value::String(gid) => Ok(gid),
        other => Err(RpcError::Decode {
            method: method.to_string(),
            detail: format!("expected a GID string, got {}", other),
        }),
    }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, result: Value) -> Result<T, RpcError> {
    serde_json::from_value(result).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let body = request_body(
            "dlmgr-1",
            "aria2.addUri",
            "secret123",
            vec![json!(["magnet:?xt=urn:btih:abc"]), json!({"dir": "/tmp"})],
        );
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], "dlmgr-1");
        assert_eq!(body["method"], "aria2.addUri");
        assert_eq!(body["params"][0], "token:secret123");
        assert_eq!(body["params"][1][0], "magnet:?xt=urn:btih:abc");
        assert_eq!(body["params"][2]["dir"], "/tmp");
    }

    #[test]
    fn test_probe_has_only_token() {
        let body = request_body("p", "aria2.getVersion", "s", Vec::new());
        assert_eq!(body["params"], json!(["token:s"]));
    }

    #[test]
    fn test_status_decodes_camel_case() {
        let raw = json!({
            "gid": "2089b05ecca3d829",
            "status": "active",
            "totalLength": "1000",
            "completedLength": "250",
            "downloadSpeed": "4096"
        });
        let status: Aria2Status = serde_json::from_value(raw).unwrap();
        assert_eq!(status.completed_length.as_deref(), Some("250"));
        assert_eq!(status.error_message, None);
    }

    #[test]
    fn test_url_format() {
        let client = RpcClient::new("localhost", 6800, "secret123");
        assert_eq!(client.url(), "http://localhost:6800/jsonrpc");
        assert_eq!(client.port(), 6800);
    }
}
