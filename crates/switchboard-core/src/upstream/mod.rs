//! Endpoint management and call routing.
//!
//! This module handles everything between a caller and the JSON-RPC endpoints of a
//! network:
//! - HTTP and WebSocket client implementations
//! - Endpoint registry with automatic reconnects and network block tracking
//! - Rating-based endpoint selection with tag matching
//! - Bounded retry across endpoints
//! - Penalty persistence and recovery through a shared store
//! - Active probing of degraded endpoints
//!
//! # Routing
//!
//! Every passive failure costs an endpoint one rating point and only endpoints at the
//! network's maximum rating are eligible, so a failing endpoint drops out of rotation
//! after its first failure and returns once its penalty expires or its probes succeed.
//!
//! ```text
//! NetworkClient::call
//!       │
//!       ▼
//! [chain id query?] ── Yes ──► answered from configuration
//!       │
//!       ▼
//! Selector (max rating → method tag → member tag → all)
//!       │
//!       ▼
//! Endpoint client ── Err ──► RatingStore::lower ──► retry while budget lasts
//!       │
//!       ▼
//!  Call log
//! ```

pub mod call_log;
pub mod client;
pub mod dispatcher;
pub mod endpoint;
pub mod errors;
pub mod events;
pub mod http_client;
pub mod prober;
pub mod rating;
pub mod registry;
pub mod selector;
pub mod websocket;

pub use call_log::{CallLog, CallLogEntry, DEFAULT_CALL_LOG_CAPACITY};
pub use client::{ClientConnector, ConnectionParams, DefaultConnector, RpcClient};
pub use dispatcher::{DispatchOptions, NetworkClient};
pub use endpoint::{Endpoint, DEFAULT_RATING};
pub use errors::{ConfigurationError, DispatchError, UpstreamError};
pub use events::{EventEmitter, Listener};
pub use http_client::HttpRpcClient;
pub use prober::{ProbeConfig, ProbeOutcome, Prober};
pub use rating::RatingStore;
pub use registry::{EndpointRegistry, Network, ReconnectError};
pub use selector::PickAlgorithm;
pub use websocket::WsRpcClient;
