//! # Switchboard Core
//!
//! Adaptive multi-endpoint JSON-RPC routing for blockchain networks.
//!
//! Each configured network gets one logical client backed by several endpoints. Calls go
//! to the healthiest endpoints, failures move the call to another endpoint and lower the
//! failing endpoint's rating, and degraded endpoints are probed until they recover.
//!
//! This crate provides:
//!
//! - **[`upstream`]**: Endpoint clients (HTTP and WebSocket), the endpoint registry,
//!   rating-based selection, the retrying [`NetworkClient`](upstream::NetworkClient),
//!   probing and rating recovery.
//!
//! - **[`store`]**: Key-value store shared between processes for penalties, probe counters
//!   and probe leases.
//!
//! - **[`runtime`]**: Owner of every component and background task.
//!
//! - **[`config`]**: Layered configuration loading and validation.
//!
//! - **[`logging`]**: Tracing subscriber setup.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      SwitchboardRuntime                       │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ EndpointRegistry │  │ RatingStore  │  │    CallLog      │  │
//! │  └────────┬─────────┘  └──────┬───────┘  └─────────────────┘  │
//! │           │                   │                               │
//! │  ┌────────▼─────────┐  ┌──────▼───────┐  ┌─────────────────┐  │
//! │  │ Network          │  │   KvStore    │◄─┤ Prober (per     │  │
//! │  │  └─ Endpoint ... │  │ Memory/Redis │  │  endpoint)      │  │
//! │  └──────────────────┘  └──────────────┘  └─────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! NetworkClient::call(RpcCall)
//!       │
//!       ▼
//! ┌─────────────┐
//! │  Encoding   │ ─── Invalid ──► DispatchError::Upstream
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │  Selector   │ ─── eth_chainId ──► answered from configuration
//! └──────┬──────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │  Endpoint   │ ─── Error ──► lower rating ──► retry or ExhaustedRetries
//! └──────┬──────┘
//!        │
//!        ▼
//!   Call log ──► Response
//! ```

pub mod config;
pub mod logging;
pub mod runtime;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod upstream;
