//! Switchboard runtime initialization and lifecycle management.
//!
//! The runtime replaces process-wide state: it owns the endpoint registry, the shared
//! store, the rating store and the call log, and hands out one [`NetworkClient`] per
//! network. It also runs the background tasks (one prober per endpoint, rating recovery
//! and store reaping) and stops them on shutdown.
//!
//! # Example
//!
//! ```no_run
//! use switchboard_core::{config::AppConfig, runtime::SwitchboardRuntime, types::BlockId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load()?;
//!     switchboard_core::logging::init_logging(&config.logging);
//!
//!     let runtime = SwitchboardRuntime::builder().with_config(config).build().await?;
//!
//!     let mainnet = runtime.network("mainnet")?;
//!     let block = mainnet.get_block(BlockId::Latest).await?;
//!     println!("{block}");
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! [`NetworkClient`]: crate::upstream::NetworkClient

pub mod builder;
pub mod lifecycle;

pub use builder::{RuntimeError, SwitchboardRuntimeBuilder};
pub use lifecycle::SwitchboardRuntime;
