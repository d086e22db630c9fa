//! Downlink engine
//!
//! This module turns device state into transmitted frames:
//! - Data downlink generation
//! - Downlink path ranking
//! - Scheduling on Gateway Servers and the Packet Broker Agent
//! - Matching of TX acknowledgments to scheduled downlinks

/// Data downlink generation
pub mod generator;

/// Scheduled downlink matcher
pub mod matcher;

/// Downlink path ranking
pub mod paths;

/// Downlink scheduler
pub mod scheduler;

pub use generator::{generate, Effects, GeneratedDownlink, GeneratorContext};
pub use matcher::{new_downlink_correlation_id, ScheduledDownlink, ScheduledDownlinkMatcher};
pub use scheduler::{is_terminal, ScheduledRecord, Scheduler, Target};
