//! Routing behaviour of `NetworkClient` through a fully built runtime.
//!
//! Every endpoint is backed by a scripted client, so failures and responses are set per
//! url and no sockets are opened. Probers and rating recovery are disabled to keep ratings
//! under the test's control.

use serde_json::{json, Value};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use switchboard_core::{
    config::{AppConfig, EndpointConfig, NetworkConfig},
    runtime::SwitchboardRuntime,
    store::MemoryStore,
    testing::ScriptedConnector,
    types::{BlockId, RpcCall},
    upstream::{
        ConfigurationError, DispatchError, Listener, PickAlgorithm, RpcClient, UpstreamError,
    },
};

const NETWORK: &str = "mainnet";

fn endpoint(url: &str, tags: &[&str], primary: bool) -> EndpointConfig {
    EndpointConfig {
        url: url.to_string(),
        tags: tags.iter().map(|t| (*t).to_string()).collect(),
        primary,
    }
}

fn config_with(endpoints: Vec<EndpointConfig>) -> AppConfig {
    let mut config = AppConfig::default();
    config
        .networks
        .insert(NETWORK.to_string(), NetworkConfig { chain_id: 1, endpoints });
    config
}

async fn start(config: AppConfig, connector: &Arc<ScriptedConnector>) -> SwitchboardRuntime {
    SwitchboardRuntime::builder()
        .with_config(config)
        .with_connector(connector.clone())
        .with_store(Arc::new(MemoryStore::new()))
        .disable_probers()
        .disable_recovery()
        .build()
        .await
        .expect("runtime should build")
}

fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = counter.clone();
    Arc::new(move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn test_method_tag_routing_falls_back_after_failures() {
    let config = config_with(vec![
        endpoint("https://a.example", &["call", "sendTx"], false),
        endpoint("https://b.example", &["call"], true),
        endpoint("https://c.example", &["logs"], false),
        endpoint("https://d.example", &["call"], false),
    ]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    let client = runtime.network(NETWORK).unwrap();

    for _ in 0..20 {
        client.call(RpcCall::send_as("call", "sendTx", json!([]))).await.unwrap();
    }
    let urls: HashSet<String> =
        runtime.call_log().entries().into_iter().map(|entry| entry.endpoint_url).collect();
    assert_eq!(urls, HashSet::from(["https://a.example".to_string()]));

    let a = runtime.registry().endpoint(NETWORK, "https://a.example").unwrap();
    runtime.ratings().lower(&a).await;
    runtime.ratings().lower(&a).await;
    assert_eq!(a.rating(), 98);

    for _ in 0..40 {
        client.call(RpcCall::send_as("call", "sendTx", json!([]))).await.unwrap();
        let latest = runtime.call_log().latest().unwrap();
        assert!(
            ["https://b.example", "https://d.example"].contains(&latest.endpoint_url.as_str()),
            "unexpected endpoint {}",
            latest.endpoint_url
        );
        assert_eq!(latest.member, "call");
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_round_robin_never_repeats_an_endpoint() {
    let config = config_with(vec![
        endpoint("https://a.example", &[], false),
        endpoint("https://b.example", &[], false),
        endpoint("https://c.example", &[], false),
    ]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    let client = runtime.network(NETWORK).unwrap();

    for _ in 0..30 {
        client.send("eth_gasPrice", json!([])).await.unwrap();
    }

    let urls: Vec<String> =
        runtime.call_log().entries().into_iter().map(|entry| entry.endpoint_url).collect();
    assert_eq!(urls.len(), 30);
    for pair in urls.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failing_endpoint_is_avoided() {
    let mut config = config_with(vec![
        endpoint("https://a.example", &[], true),
        endpoint("https://b.example", &[], false),
    ]);
    config.routing.pick_algorithm = PickAlgorithm::Primary;
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;

    let a = connector.client("https://a.example").unwrap();
    a.set_default_result(Err(UpstreamError::Timeout));
    let b = connector.client("https://b.example").unwrap();
    b.set_default_result(Ok(json!("0x10")));

    let client = runtime.network(NETWORK).unwrap();
    assert_eq!(client.get_block_number().await.unwrap(), 16);
    assert_eq!(client.get_block_number().await.unwrap(), 16);

    // One failure on the primary, then every call goes to the remaining endpoint.
    assert_eq!(a.requests().len(), 1);
    assert_eq!(b.requests().len(), 2);
    let a_endpoint = runtime.registry().endpoint(NETWORK, "https://a.example").unwrap();
    assert_eq!(a_endpoint.rating(), 99);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_wraps_last_failure() {
    let mut config = config_with(vec![
        endpoint("https://a.example", &[], false),
        endpoint("https://b.example", &[], false),
    ]);
    config.routing.max_fails_per_call = 1;
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;

    connector
        .client("https://a.example")
        .unwrap()
        .set_default_result(Err(UpstreamError::RpcError(-32001, "a down".to_string())));
    connector
        .client("https://b.example")
        .unwrap()
        .set_default_result(Err(UpstreamError::RpcError(-32002, "b down".to_string())));

    let client = runtime.network(NETWORK).unwrap();
    let err = client.get_block(BlockId::Latest).await.unwrap_err();

    let DispatchError::ExhaustedRetries { attempts, endpoints, source } = err else {
        panic!("expected ExhaustedRetries, got {err:?}");
    };
    assert_eq!(attempts, 2);
    assert_eq!(endpoints.len(), 2);
    assert_ne!(endpoints[0], endpoints[1]);

    let expected_code = if endpoints[1] == "https://a.example" { -32001 } else { -32002 };
    assert!(matches!(source, UpstreamError::RpcError(code, _) if code == expected_code));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_chain_id_is_answered_from_configuration() {
    let config = config_with(vec![endpoint("https://a.example", &[], false)]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    let client = runtime.network(NETWORK).unwrap();

    assert_eq!(client.chain_id().await.unwrap(), 1);
    let raw = client.call(RpcCall::send("eth_chainId", json!([]))).await.unwrap();
    assert_eq!(raw, json!("0x1"));

    assert!(connector.client("https://a.example").unwrap().requests().is_empty());
    let latest = runtime.call_log().latest().unwrap();
    assert!(latest.cached);
    assert_eq!(latest.member, "send");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_subscriptions_reach_every_endpoint() {
    let urls = ["https://a.example", "https://b.example", "https://c.example"];
    let config = config_with(urls.iter().map(|url| endpoint(url, &[], false)).collect());
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    let client = runtime.network(NETWORK).unwrap();

    let pending = Arc::new(AtomicUsize::new(0));
    let listener = counting_listener(&pending);
    client.on("pending", listener.clone());
    for url in urls {
        assert_eq!(connector.client(url).unwrap().listener_count("pending"), 1);
    }

    for url in urls {
        connector.client(url).unwrap().emit("pending", &json!("0xabc"));
    }
    assert_eq!(pending.load(Ordering::SeqCst), 3);

    client.off("pending", Some(&listener));
    for url in urls {
        assert_eq!(connector.client(url).unwrap().listener_count("pending"), 0);
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_once_listener_fires_once_per_endpoint() {
    let config = config_with(vec![
        endpoint("https://a.example", &[], false),
        endpoint("https://b.example", &[], false),
    ]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    let client = runtime.network(NETWORK).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    client.once("pending", counting_listener(&fired));

    let a = connector.client("https://a.example").unwrap();
    a.emit("pending", &json!(1));
    a.emit("pending", &json!(2));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_property_write_skips_unsupported_endpoints() {
    let config = config_with(vec![
        endpoint("https://a.example", &[], false),
        endpoint("https://b.example", &[], false),
    ]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    connector.client("https://b.example").unwrap().mark_unsupported("pollingInterval");

    let client = runtime.network(NETWORK).unwrap();
    let written = client.set_property("pollingInterval", &json!(1_000)).unwrap();
    assert_eq!(written, 1);

    let a = connector.client("https://a.example").unwrap();
    assert_eq!(a.get_property("pollingInterval").unwrap(), json!(1_000));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_restart_reconnects_every_endpoint() {
    let config = config_with(vec![
        endpoint("https://a.example", &[], false),
        endpoint("https://b.example", &[], false),
    ]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;
    let before = connector.client("https://a.example").unwrap();

    let client = runtime.network(NETWORK).unwrap();
    assert_eq!(client.restart(), 2);

    assert_eq!(connector.connect_count("https://a.example"), 2);
    assert_eq!(connector.connect_count("https://b.example"), 2);
    assert!(before.is_closed());
    assert!(!connector.client("https://a.example").unwrap().is_closed());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_network_is_a_configuration_error() {
    let config = config_with(vec![endpoint("https://a.example", &[], false)]);
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = start(config, &connector).await;

    let err = runtime.network("ropsten").unwrap_err();
    assert_eq!(err, ConfigurationError::UnknownNetwork("ropsten".to_string()));

    runtime.shutdown().await;
}
