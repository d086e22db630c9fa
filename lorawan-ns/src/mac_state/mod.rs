//! MAC state engine
//!
//! This module contains the per-uplink and per-downlink MAC logic:
//! - Handling of the MAC commands sent by the device
//! - Adaptive data rate
//! - Enqueueing of the MAC requests that move the device towards the
//!   desired parameters

/// Adaptive data rate
pub mod adr;

/// MAC request enqueuers
pub mod enqueue;

/// Uplink MAC command handlers
pub mod handlers;

pub use enqueue::{enqueue_requests, Budget, EnqueueContext};
pub use handlers::{handle_commands, HandleContext, HandleOutcome};
