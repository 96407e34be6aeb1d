//! Rating recovery through the runtime's background tasks.
//!
//! Time is paused, so probe intervals, counter TTLs and penalty expiries elapse
//! instantly and in order.

use serde_json::json;
use std::{sync::Arc, time::Duration};
use switchboard_core::{
    config::{AppConfig, EndpointConfig, NetworkConfig, StoreBackend},
    runtime::SwitchboardRuntime,
    store::{KvStore, StoreKey},
    testing::ScriptedConnector,
    upstream::{UpstreamError, DEFAULT_RATING},
};

const NETWORK: &str = "mainnet";
const A: &str = "https://a.example";
const B: &str = "https://b.example";

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.backend = StoreBackend::Memory;
    config.store.low_rating_expiry_seconds = 2;
    config.store.recovery_poll_interval_seconds = 3_600;
    config.store.reap_interval_ms = 100;
    config.probe.interval_ms = 1_000;
    config.probe.timeout_ms = 500;
    config.probe.max_fails = 2;
    config.probe.min_successes = 3;
    config.networks.insert(
        NETWORK.to_string(),
        NetworkConfig {
            chain_id: 1,
            endpoints: [A, B]
                .iter()
                .map(|url| EndpointConfig { url: (*url).to_string(), tags: vec![], primary: false })
                .collect(),
        },
    );
    config
}

#[tokio::test(start_paused = true)]
async fn test_penalty_expiry_restores_rating_without_probing() {
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = SwitchboardRuntime::builder()
        .with_config(config())
        .with_connector(connector.clone())
        .disable_probers()
        .build()
        .await
        .unwrap();

    let a = runtime.registry().endpoint(NETWORK, A).unwrap();
    runtime.ratings().lower(&a).await;
    assert_eq!(a.rating(), DEFAULT_RATING - 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(a.rating(), DEFAULT_RATING - 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(a.rating(), DEFAULT_RATING);
    assert!(connector.client(A).unwrap().requests().is_empty());

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_polling_restores_rating_when_notifications_are_missed() {
    let mut config = config();
    config.store.recovery_poll_interval_seconds = 1;

    let connector = Arc::new(ScriptedConnector::new());
    let runtime = SwitchboardRuntime::builder()
        .with_config(config)
        .with_connector(connector)
        .disable_probers()
        .build()
        .await
        .unwrap();

    let a = runtime.registry().endpoint(NETWORK, A).unwrap();
    runtime.ratings().lower(&a).await;

    // Drop the penalty key before it expires so no notification is ever published.
    runtime.store().delete(&StoreKey::rating(NETWORK, A).to_string()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(a.rating(), DEFAULT_RATING);

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_prober_demotes_once_then_recovers() {
    let mut config = config();
    config.store.low_rating_expiry_seconds = 3_600;
    config.probe.max_inter_block_interval_ms = 500;

    let connector = Arc::new(ScriptedConnector::new());
    let runtime = SwitchboardRuntime::builder()
        .with_config(config)
        .with_connector(connector.clone())
        .disable_recovery()
        .build()
        .await
        .unwrap();

    let a = runtime.registry().endpoint(NETWORK, A).unwrap();
    let client = connector.client(A).unwrap();
    client.set_default_result(Err(UpstreamError::Timeout));

    // A goes quiet after 500ms, so failed probes at 1s and 2s reach the threshold.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(a.rating(), DEFAULT_RATING - 1);

    // At the threshold the prober backs off instead of demoting again.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(a.rating(), DEFAULT_RATING - 1);

    client.set_default_result(Ok(json!({"number": "0x64"})));
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(a.rating(), DEFAULT_RATING);
    assert_eq!(runtime.registry().network(NETWORK).unwrap().latest_block(), 100);

    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_healthy_endpoint_is_not_probed() {
    let connector = Arc::new(ScriptedConnector::new());
    let runtime = SwitchboardRuntime::builder()
        .with_config(config())
        .with_connector(connector.clone())
        .disable_recovery()
        .build()
        .await
        .unwrap();

    let b = runtime.registry().endpoint(NETWORK, B).unwrap();
    let client = connector.client(B).unwrap();

    // Blocks keep arriving, so no probe is ever sent.
    for number in 1..=10_u64 {
        b.observe_block(number);
        tokio::time::sleep(Duration::from_millis(900)).await;
    }

    assert!(client.requests().is_empty());
    assert_eq!(b.rating(), DEFAULT_RATING);

    runtime.shutdown().await;
}
