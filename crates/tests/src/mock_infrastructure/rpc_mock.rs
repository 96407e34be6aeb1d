//! Mock JSON-RPC endpoint for HTTP client and routing tests.
//!
//! Wraps mockito with helpers for the methods the router sends: block fetches, block
//! numbers, logs and arbitrary methods, plus error and throttling responses.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

fn method_matcher(method: &str) -> Matcher {
    Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))
}

/// A mockito server answering JSON-RPC requests.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl RpcMockBuilder {
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    async fn respond(&mut self, matcher: Matcher, body: Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(matcher)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Answers `method` with `result`.
    pub async fn mock_method(&mut self, method: &str, result: &Value) -> &mut Self {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": result});
        self.respond(method_matcher(method), body).await
    }

    pub async fn mock_block_number(&mut self, block_number: u64) -> &mut Self {
        self.mock_method("eth_blockNumber", &json!(format!("0x{block_number:x}"))).await
    }

    /// Answers `eth_getBlockByNumber` for the `latest` tag.
    pub async fn mock_latest_block(&mut self, block: &Value) -> &mut Self {
        let matcher = Matcher::AllOf(vec![
            method_matcher("eth_getBlockByNumber"),
            Matcher::Regex(r#""params"\s*:\s*\["latest""#.to_string()),
        ]);
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": block});
        self.respond(matcher, body).await
    }

    pub async fn mock_get_logs(&mut self, logs: &[Value]) -> &mut Self {
        self.mock_method("eth_getLogs", &json!(logs)).await
    }

    /// Answers `method` with a JSON-RPC error object.
    pub async fn mock_rpc_error(&mut self, method: &str, code: i32, message: &str) -> &mut Self {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": code, "message": message}
        });
        self.respond(method_matcher(method), body).await
    }

    /// Answers every request with an HTTP status and plain body.
    pub async fn mock_http_status(&mut self, status: usize, body: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(status)
            .with_body(body)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Answers the next `hits` requests with HTTP 429 and a `Retry-After` header.
    pub async fn mock_throttled(&mut self, retry_after_seconds: u64, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(429)
            .with_header("retry-after", &retry_after_seconds.to_string())
            .with_body("rate limited")
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    #[must_use]
    pub fn verify_all_called(&self) -> bool {
        self.mocks.iter().all(Mock::matched)
    }
}

/// Builder for `eth_getBlockByNumber` results.
pub struct BlockResponseBuilder {
    number: u64,
    hash: String,
    parent_hash: String,
    transactions: Vec<Value>,
}

impl BlockResponseBuilder {
    #[must_use]
    pub fn new(number: u64) -> Self {
        Self {
            number,
            hash: format!("0x{number:064x}"),
            parent_hash: format!("0x{:064x}", number.saturating_sub(1)),
            transactions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    #[must_use]
    pub fn with_transactions(mut self, txs: Vec<Value>) -> Self {
        self.transactions = txs;
        self
    }

    #[must_use]
    pub fn build(self) -> Value {
        json!({
            "number": format!("0x{:x}", self.number),
            "hash": self.hash,
            "parentHash": self.parent_hash,
            "timestamp": format!("0x{:x}", 1_600_000_000 + self.number),
            "transactions": self.transactions,
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "miner": "0x0000000000000000000000000000000000000000"
        })
    }
}

/// Builds one `eth_getLogs` entry.
#[must_use]
pub fn log_entry(block_number: u64, log_index: u64) -> Value {
    json!({
        "address": "0x0000000000000000000000000000000000000001",
        "blockNumber": format!("0x{block_number:x}"),
        "blockHash": format!("0x{block_number:064x}"),
        "logIndex": format!("0x{log_index:x}"),
        "transactionHash": format!("0x{:064x}", block_number * 100 + log_index),
        "transactionIndex": "0x0",
        "topics": [format!("0x{:064x}", 0)],
        "data": "0x",
        "removed": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rpc_mock_builder_creation() {
        let mock = RpcMockBuilder::new().await;
        assert!(mock.url().starts_with("http://"));
    }

    #[test]
    fn test_block_response_builder() {
        let block = BlockResponseBuilder::new(100).with_hash("0xabcdef").build();
        assert_eq!(block["number"], "0x64");
        assert_eq!(block["hash"], "0xabcdef");
    }

    #[test]
    fn test_log_entry() {
        let log = log_entry(100, 5);
        assert_eq!(log["blockNumber"], "0x64");
        assert_eq!(log["logIndex"], "0x5");
    }
}
