//! LoRaWAN protocol implementation
//!
//! This module contains the wire-level protocol pieces, including:
//! - PHY payload codec
//! - MAC command codec
//! - Regional parameters
//! - Receive window timing

/// MAC command handling
pub mod commands;

/// PHY payload codec
pub mod mac;

/// Receive window timing
pub mod phy;

/// Regional parameters and configurations
pub mod region;

pub use commands::{Cid, MacCommand};
pub use mac::{MacError, MacVersion, PhyVersion, MType, PHYPayload};
pub use phy::TimingParams;
pub use region::Band;
