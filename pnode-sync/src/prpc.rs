/**
 * pRPC CLIENT - single `get-stats` exchange with one pNode
 *
 * ROLE:
 * Sends one JSON-RPC 2.0 request to `http://<addr>:<port><path>` and waits up
 * to the configured timeout for the statistics payload.
 *
 * BEHAVIOUR:
 * - exactly one attempt, no retry (retry policy belongs to the caller)
 * - every failure mode (transport, timeout, HTTP status, bad JSON, rpc error,
 *   empty result) comes back as a `ProbeError` value, never a panic
 */

use crate::config::PrpcConf;
use crate::models::NodeStats;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const STATS_METHOD: &str = "get-stats";

/// Why a pNode could not be read. Counted as a failure by the collector.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("{address}: timed out after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },
    #[error("{address}: request failed: {reason}")]
    Transport { address: String, reason: String },
    #[error("{address}: HTTP {status}")]
    Status { address: String, status: u16 },
    #[error("{address}: malformed response: {reason}")]
    Malformed { address: String, reason: String },
    #[error("{address}: rpc error {code}: {message}")]
    Rpc { address: String, code: i64, message: String },
    #[error("{address}: response carried no result")]
    EmptyResult { address: String },
}

/// Anything that can produce statistics for a roster address.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch_stats(&self, address: &str) -> Result<NodeStats, ProbeError>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    id: u32,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<NodeStats>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone)]
pub struct PrpcClient {
    http: reqwest::Client,
    port: u16,
    path: String,
    timeout: Duration,
}

impl PrpcClient {
    pub fn new(conf: &PrpcConf) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_millis(conf.timeout_ms);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let path = if conf.path.starts_with('/') { conf.path.clone() } else { format!("/{}", conf.path) };
        Ok(Self { http, port: conf.port, path, timeout })
    }

    fn endpoint(&self, address: &str) -> String {
        format!("http://{}:{}{}", address, self.port, self.path)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn classify(&self, address: &str, err: reqwest::Error) -> ProbeError {
        if err.is_timeout() {
            ProbeError::Timeout { address: address.to_string(), timeout_ms: self.timeout_ms() }
        } else {
            ProbeError::Transport { address: address.to_string(), reason: err.to_string() }
        }
    }
}

#[async_trait]
impl StatsSource for PrpcClient {
    async fn fetch_stats(&self, address: &str) -> Result<NodeStats, ProbeError> {
        let request = RpcRequest { jsonrpc: "2.0", method: STATS_METHOD, id: 1 };

        let response = self
            .http
            .post(self.endpoint(address))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(address, e))?;

        if !response.status().is_success() {
            return Err(ProbeError::Status {
                address: address.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(address, e))?;
        let parsed: RpcResponse = serde_json::from_slice(&body).map_err(|e| ProbeError::Malformed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        match (parsed.result, parsed.error) {
            (Some(stats), _) => Ok(stats),
            (None, Some(err)) => Err(ProbeError::Rpc {
                address: address.to_string(),
                code: err.code,
                message: err.message,
            }),
            (None, None) => Err(ProbeError::EmptyResult { address: address.to_string() }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    pub(crate) fn sample_stats(file_size: u64, uptime: u64) -> NodeStats {
        NodeStats {
            active_streams: 3,
            cpu_percent: 12.5,
            current_index: 42,
            file_size,
            last_updated: 1_733_000_000,
            packets_received: 1_000,
            packets_sent: 2_000,
            ram_total: 8 * 1024 * 1024 * 1024,
            ram_used: 2 * 1024 * 1024 * 1024,
            total_bytes: file_size,
            total_pages: 7,
            uptime,
        }
    }

    fn stats_json() -> serde_json::Value {
        serde_json::json!({
            "active_streams": 3,
            "cpu_percent": 12.5,
            "current_index": 42,
            "file_size": 104857600u64,
            "last_updated": 1733000000u64,
            "packets_received": 1000,
            "packets_sent": 2000,
            "ram_total": 8589934592u64,
            "ram_used": 2147483648u64,
            "total_bytes": 104857600u64,
            "total_pages": 7,
            "uptime": 86400
        })
    }

    fn client_for(server: &MockServer, timeout_ms: u64) -> PrpcClient {
        let conf = PrpcConf { port: server.address().port(), path: "/rpc".into(), timeout_ms };
        PrpcClient::new(&conf).unwrap()
    }

    fn host(server: &MockServer) -> String {
        server.address().ip().to_string()
    }

    #[tokio::test]
    async fn test_fetch_stats_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_json(serde_json::json!({"jsonrpc": "2.0", "method": "get-stats", "id": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": stats_json(), "error": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let stats = client_for(&server, 1_000).fetch_stats(&host(&server)).await.unwrap();
        assert_eq!(stats.file_size, 104_857_600);
        assert_eq!(stats.uptime, 86_400);
        assert_eq!(stats.ram_total, 8_589_934_592);
    }

    #[tokio::test]
    async fn test_large_counters_survive_decoding() {
        let server = MockServer::start().await;
        let mut payload = stats_json();
        payload["packets_sent"] = serde_json::json!(9_007_199_254_740_993u64);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": payload
            })))
            .mount(&server)
            .await;

        let stats = client_for(&server, 1_000).fetch_stats(&host(&server)).await.unwrap();
        assert_eq!(stats.packets_sent, 9_007_199_254_740_993);
    }

    #[tokio::test]
    async fn test_rpc_error_object_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": null,
                "error": {"code": -32601, "message": "method not found"}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server, 1_000).fetch_stats(&host(&server)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_null_result_without_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": null})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, 1_000).fetch_stats(&host(&server)).await.unwrap_err();
        assert!(matches!(err, ProbeError::EmptyResult { .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, 1_000).fetch_stats(&host(&server)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_non_success_status_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server, 1_000).fetch_stats(&host(&server)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_slow_node_times_out_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": stats_json()}))
                    .set_delay(Duration::from_millis(800)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server, 150).fetch_stats(&host(&server)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout { timeout_ms: 150, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transport_error() {
        // port 9 (discard) on loopback is closed on CI hosts
        let conf = PrpcConf { port: 9, path: "rpc".into(), timeout_ms: 500 };
        let client = PrpcClient::new(&conf).unwrap();
        assert_eq!(client.endpoint("127.0.0.1"), "http://127.0.0.1:9/rpc");
        assert!(client.fetch_stats("127.0.0.1").await.is_err());
    }
}
