//! LoRaWAN network server core in Rust
//!
//! This crate implements the device-facing half of a LoRaWAN Network Server.
//! It deduplicates uplinks received by several gateways, matches them to a
//! device session, runs the MAC layer and schedules downlinks on Gateway
//! Servers or through Packet Broker.
//!
//! # Features
//! - LoRaWAN 1.0, 1.0.1 to 1.0.4 and 1.1 sessions
//! - Class A, B and C downlinks
//! - OTAA through a Join Server and ABP
//! - Adaptive data rate
//! - EU868, US915 and AS923 regional parameters
//! - Persistent downlink task queue
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use lorawan_ns::{
//!     clock::SystemClock,
//!     config::NetworkServerConfig,
//!     crypto::keyvault::MemoryKeyVault,
//!     events::TracingEventSink,
//!     peers::Peers,
//!     store::MemoryRegistry,
//!     NetworkServer,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> lorawan_ns::error::Result<()> {
//! let config = NetworkServerConfig::from_toml_str(r#"net_id = "000013""#)?;
//! let ns = Arc::new(NetworkServer::new(
//!     config,
//!     Arc::new(MemoryRegistry::new()),
//!     Peers::new(),
//!     Arc::new(MemoryKeyVault::new()),
//!     Arc::new(TracingEventSink),
//!     Arc::new(SystemClock),
//! )?);
//!
//! let cancel = CancellationToken::new();
//! let workers = ns.start(cancel.clone());
//!
//! // Hand gateway uplinks to `ns.handle_uplink(..)` here.
//!
//! cancel.cancel();
//! for worker in workers {
//!     let _ = worker.await;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Application Server link
pub mod application;

/// Downlink slots per device class
pub mod class;

/// Wall clock abstraction
pub mod clock;

/// Network server configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// End device model
pub mod device;

/// Downlink generation and scheduling
pub mod downlink;

/// Errors
pub mod error;

/// Events
pub mod events;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// MAC state engine
pub mod mac_state;

/// Gateway and join messages
pub mod messages;

/// Remote peers
pub mod peers;

/// Network server
pub mod server;

/// Device registry and task queue
pub mod store;

mod task;

/// Uplink processing
pub mod uplink;

pub use error::{Error, ErrorKind, Reason, Result};
pub use server::NetworkServer;
