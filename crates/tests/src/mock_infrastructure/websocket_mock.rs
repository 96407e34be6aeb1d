//! Mock WebSocket JSON-RPC node.
//!
//! Answers requests by id from a per-method result table, confirms `eth_subscribe`, and
//! pushes `newHeads` notifications or close frames to every connected client on demand.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const SUBSCRIPTION_ID: &str = "0x9ce59a13059e417087c02d3236a0b9cc";

#[derive(Default)]
struct NodeState {
    results: RwLock<HashMap<String, Value>>,
    errors: RwLock<HashMap<String, (i64, String)>>,
    received: RwLock<Vec<String>>,
    connections: AtomicUsize,
}

/// A WebSocket JSON-RPC node bound to a random local port.
pub struct MockWebSocketServer {
    addr: SocketAddr,
    state: Arc<NodeState>,
    push_tx: broadcast::Sender<Message>,
    server_handle: JoinHandle<()>,
}

impl MockWebSocketServer {
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to a local port.
    pub async fn new() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(NodeState::default());
        let (push_tx, _) = broadcast::channel(64);

        let server_handle = tokio::spawn(Self::accept_loop(listener, state.clone(), push_tx.clone()));

        Ok(Self { addr, state, push_tx, server_handle })
    }

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<NodeState>,
        push_tx: broadcast::Sender<Message>,
    ) {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(Self::handle_connection(stream, state.clone(), push_tx.subscribe()));
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        state: Arc<NodeState>,
        mut push_rx: broadcast::Receiver<Message>,
    ) {
        let Ok(ws_stream) = accept_async(stream).await else { return };
        state.connections.fetch_add(1, Ordering::SeqCst);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text.to_string(),
                        Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    state.received.write().await.push(text.clone());

                    let Some(reply) = Self::reply_to(&state, &text).await else { continue };
                    if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
                pushed = push_rx.recv() => {
                    let Ok(message) = pushed else { break };
                    let closing = matches!(message, Message::Close(_));
                    if write.send(message).await.is_err() || closing {
                        break;
                    }
                }
            }
        }

        state.connections.fetch_sub(1, Ordering::SeqCst);
    }

    async fn reply_to(state: &NodeState, text: &str) -> Option<Value> {
        let request: Value = serde_json::from_str(text).ok()?;
        let id = request.get("id")?.clone();
        let method = request.get("method")?.as_str()?;

        if method == "eth_subscribe" {
            return Some(json!({"jsonrpc": "2.0", "id": id, "result": SUBSCRIPTION_ID}));
        }
        if let Some((code, message)) = state.errors.read().await.get(method) {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            }));
        }
        let result = state.results.read().await.get(method).cloned().unwrap_or(Value::Null);
        Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Answers `method` with `result` from now on.
    pub async fn respond_with(&self, method: &str, result: Value) {
        self.state.results.write().await.insert(method.to_string(), result);
    }

    /// Answers `method` with a JSON-RPC error from now on.
    pub async fn fail_with(&self, method: &str, code: i64, message: &str) {
        self.state.errors.write().await.insert(method.to_string(), (code, message.to_string()));
    }

    /// Pushes a `newHeads` notification to every connected client.
    pub fn send_new_head(&self, block_number: u64) {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": SUBSCRIPTION_ID,
                "result": {
                    "number": format!("0x{block_number:x}"),
                    "hash": format!("0x{block_number:064x}"),
                    "parentHash": format!("0x{:064x}", block_number.saturating_sub(1)),
                    "timestamp": format!("0x{:x}", 1_600_000_000 + block_number)
                }
            }
        });
        let _ = self.push_tx.send(Message::Text(notification.to_string().into()));
    }

    /// Closes every connected client.
    pub fn close_connections(&self) {
        let _ = self.push_tx.send(Message::Close(None));
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Waits until `count` clients are connected.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connection_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Waits until a message containing `needle` has been received.
    pub async fn wait_for_message(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state.received.read().await.iter().any(|m| m.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn received_messages(&self) -> Vec<String> {
        self.state.received.read().await.clone()
    }
}

impl Drop for MockWebSocketServer {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_answers_requests_by_id() {
        let server = MockWebSocketServer::new().await.unwrap();
        server.respond_with("eth_blockNumber", json!("0x10")).await;

        let (mut ws, _) = connect_async(server.url()).await.expect("connect");
        let request = json!({"jsonrpc": "2.0", "id": 42, "method": "eth_blockNumber", "params": []});
        ws.send(Message::Text(request.to_string().into())).await.unwrap();

        let Some(Ok(Message::Text(text))) = ws.next().await else { panic!("expected reply") };
        let reply: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reply["id"], 42);
        assert_eq!(reply["result"], "0x10");
    }

    #[tokio::test]
    async fn test_pushes_new_heads() {
        let server = MockWebSocketServer::new().await.unwrap();
        let (mut ws, _) = connect_async(server.url()).await.expect("connect");
        assert!(server.wait_for_connections(1, Duration::from_secs(2)).await);

        server.send_new_head(1000);

        let Some(Ok(Message::Text(text))) = ws.next().await else { panic!("expected head") };
        assert!(text.contains("eth_subscription"));
        assert!(text.contains("0x3e8"));
    }

    #[tokio::test]
    async fn test_close_connections() {
        let server = MockWebSocketServer::new().await.unwrap();
        let (mut ws, _) = connect_async(server.url()).await.expect("connect");
        assert!(server.wait_for_connections(1, Duration::from_secs(2)).await);

        server.close_connections();

        let next = ws.next().await;
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }
}
