//! Mock infrastructure for exercising Switchboard over real transports.
//!
//! - `RpcMockBuilder`: mockito-backed JSON-RPC node for HTTP endpoints
//! - `MockWebSocketServer`: WebSocket JSON-RPC node with `newHeads` pushes
//!
//! ## Usage
//!
//! ```ignore
//! use tests::mock_infrastructure::{BlockResponseBuilder, RpcMockBuilder};
//!
//! let mut mock = RpcMockBuilder::new().await;
//! mock.mock_latest_block(&BlockResponseBuilder::new(100).build()).await;
//!
//! // Use mock.url() as an endpoint url
//! ```

pub mod rpc_mock;
pub mod websocket_mock;

pub use rpc_mock::{log_entry, BlockResponseBuilder, RpcMockBuilder};
pub use websocket_mock::MockWebSocketServer;
