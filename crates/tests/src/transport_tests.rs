//! The runtime over real transports: HTTP endpoints served by mockito and WebSocket
//! endpoints served by [`MockWebSocketServer`].

use serde_json::json;
use std::time::Duration;
use switchboard_core::{
    config::{AppConfig, EndpointConfig, NetworkConfig},
    runtime::SwitchboardRuntime,
    types::BlockId,
    upstream::{PickAlgorithm, UpstreamError, DEFAULT_RATING},
};

use crate::mock_infrastructure::{
    log_entry, BlockResponseBuilder, MockWebSocketServer, RpcMockBuilder,
};

const NETWORK: &str = "mainnet";

fn config_for(endpoints: Vec<EndpointConfig>) -> AppConfig {
    let mut config = AppConfig::default();
    config.connection.timeout_ms = 2_000;
    config.connection.polling_interval_ms = 60_000;
    config.connection.reconnect_delay_ms = 50;
    config.networks.insert(NETWORK.to_string(), NetworkConfig { chain_id: 1, endpoints });
    config
}

fn endpoint(url: String, primary: bool) -> EndpointConfig {
    EndpointConfig { url, tags: vec![], primary }
}

async fn start(config: AppConfig) -> SwitchboardRuntime {
    SwitchboardRuntime::builder()
        .with_config(config)
        .disable_probers()
        .disable_recovery()
        .build()
        .await
        .expect("runtime should build")
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_http_failover_to_healthy_endpoint() {
    let mut failing = RpcMockBuilder::new().await;
    failing.mock_rpc_error("eth_getLogs", -32005, "query returned more than 10000 results").await;
    let mut healthy = RpcMockBuilder::new().await;
    healthy.mock_get_logs(&[log_entry(100, 0), log_entry(100, 1)]).await;

    let mut config =
        config_for(vec![endpoint(failing.url(), true), endpoint(healthy.url(), false)]);
    config.routing.pick_algorithm = PickAlgorithm::Primary;
    let runtime = start(config).await;
    let client = runtime.network(NETWORK).unwrap();

    let logs = client.get_logs(json!({"fromBlock": "0x64", "toBlock": "0x64"})).await.unwrap();
    assert_eq!(logs.as_array().map(Vec::len), Some(2));
    assert_eq!(logs[1]["logIndex"], "0x1");

    let primary = runtime.registry().endpoint(NETWORK, &failing.url()).unwrap();
    assert_eq!(primary.rating(), DEFAULT_RATING - 1);

    let latest = runtime.call_log().latest().unwrap();
    assert_eq!(latest.endpoint_url, healthy.url());
    assert_eq!(latest.member, "getLogs");
    assert!(!latest.cached);
    assert!(failing.verify_all_called());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_http_latest_block_request() {
    let tx = json!({"hash": format!("0x{:064x}", 1), "blockNumber": "0x3e8"});
    let mut node = RpcMockBuilder::new().await;
    node.mock_latest_block(&BlockResponseBuilder::new(1_000).with_transactions(vec![tx]).build())
        .await;

    let runtime = start(config_for(vec![endpoint(node.url(), false)])).await;
    let client = runtime.network(NETWORK).unwrap();

    // -1 is fetched as the latest block.
    let block = client.get_block(BlockId::Number(-1)).await.unwrap();
    assert_eq!(block["number"], "0x3e8");
    let latest = runtime.call_log().latest().unwrap();
    assert_eq!(latest.args, json!(["latest"]));

    let full = client.get_block_with_transactions(BlockId::Number(-1)).await.unwrap();
    assert_eq!(full["transactions"][0]["blockNumber"], "0x3e8");
    assert_eq!(runtime.call_log().latest().unwrap().member, "getBlockWithTransactions");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_http_block_polling_updates_latest_block() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_block_number(0x1234).await;

    let mut config = config_for(vec![endpoint(node.url(), false)]);
    config.connection.polling_interval_ms = 20;
    let runtime = start(config).await;
    let network = runtime.registry().network(NETWORK).unwrap();

    assert!(wait_until(Duration::from_secs(5), || network.latest_block() == 0x1234).await);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_http_throttling_is_retried_on_the_same_endpoint() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_throttled(0, 2).await;
    node.mock_block_number(7).await;

    let runtime = start(config_for(vec![endpoint(node.url(), false)])).await;
    let client = runtime.network(NETWORK).unwrap();

    assert_eq!(client.get_block_number().await.unwrap(), 7);
    assert!(node.verify_all_called());

    // Throttling is absorbed by the client and never counts as an endpoint failure.
    let only = runtime.registry().endpoint(NETWORK, &node.url()).unwrap();
    assert_eq!(only.rating(), DEFAULT_RATING);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_http_endpoint_failure_exhausts_retries() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_http_status(503, "service unavailable").await;

    let runtime = start(config_for(vec![endpoint(node.url(), false)])).await;
    let client = runtime.network(NETWORK).unwrap();

    let err = client.send_raw_transaction("0xdeadbeef").await.unwrap_err();
    let source = err.upstream_error().expect("endpoint error");
    assert!(matches!(source, UpstreamError::HttpError(503, _)));

    let only = runtime.registry().endpoint(NETWORK, &node.url()).unwrap();
    assert_eq!(only.rating(), DEFAULT_RATING - 3);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_websocket_endpoint_routes_calls_and_heads() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.respond_with("eth_blockNumber", json!("0x20")).await;

    let runtime = start(config_for(vec![endpoint(server.url(), false)])).await;
    let client = runtime.network(NETWORK).unwrap();

    assert_eq!(client.get_block_number().await.unwrap(), 32);
    assert!(server.wait_for_message("eth_subscribe", Duration::from_secs(2)).await);

    server.send_new_head(200);
    let network = client.network().clone();
    assert!(wait_until(Duration::from_secs(2), || network.latest_block() == 200).await);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_websocket_rpc_error_is_reported() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.fail_with("eth_call", -32000, "execution reverted").await;

    let mut config = config_for(vec![endpoint(server.url(), false)]);
    config.routing.max_fails_per_call = 0;
    let runtime = start(config).await;
    let client = runtime.network(NETWORK).unwrap();

    let err = client
        .eth_call(json!({"to": "0x0000000000000000000000000000000000000001"}), BlockId::Latest)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 attempts"));
    assert!(err.upstream_error().is_some_and(|e| e.to_string().contains("execution reverted")));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_websocket_endpoint_reconnects_after_close() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.respond_with("eth_blockNumber", json!("0x1")).await;

    let runtime = start(config_for(vec![endpoint(server.url(), false)])).await;
    let client = runtime.network(NETWORK).unwrap();
    assert!(server.wait_for_connections(1, Duration::from_secs(2)).await);

    let endpoint = runtime.registry().endpoint(NETWORK, &server.url()).unwrap();
    let generation = endpoint.generation();

    server.close_connections();
    assert!(wait_until(Duration::from_secs(3), || endpoint.generation() > generation).await);

    assert_eq!(client.get_block_number().await.unwrap(), 1);
    assert_eq!(server.connection_count(), 1);

    runtime.shutdown().await;
}
