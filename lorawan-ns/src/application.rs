//! Application Server link
//!
//! The network server submits application uplinks (data, join-accepts,
//! downlink acknowledgments and failures) per application. At most one link
//! per application is active; linking again closes the previous receiver.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::device::EndDeviceIdentifiers;
use crate::crypto::KeyEnvelope;
use crate::device::ApplicationDownlink;
use crate::error::{Error, Result};
use crate::messages::{RxMetadata, TxSettings};

/// Buffered messages per application link
const LINK_BUFFER: usize = 256;

/// Message delivered to the Application Server
#[derive(Debug, Clone)]
pub enum ApplicationUpMessage {
    /// Data uplink with an application port
    Uplink {
        /// Session the payload is encrypted for
        session_key_id: Vec<u8>,
        /// Port
        f_port: u8,
        /// Full frame counter
        f_cnt: u32,
        /// Encrypted payload
        frm_payload: Vec<u8>,
        /// Whether the uplink was confirmed
        confirmed: bool,
        /// Merged reception metadata
        rx_metadata: Vec<RxMetadata>,
        /// Transmission settings
        settings: TxSettings,
        /// Reception time
        received_at: SystemTime,
    },
    /// Device joined
    JoinAccept {
        /// Session key identifier
        session_key_id: Vec<u8>,
        /// AppSKey, wrapped for the Application Server
        app_s_key: Option<KeyEnvelope>,
        /// Join-request reception time
        received_at: SystemTime,
    },
    /// Confirmed downlink acknowledged
    DownlinkAck(ApplicationDownlink),
    /// Confirmed downlink not acknowledged
    DownlinkNack(ApplicationDownlink),
    /// Downlink transmitted
    DownlinkSent(ApplicationDownlink),
    /// Downlink dropped
    DownlinkFailed {
        /// Dropped downlink
        downlink: ApplicationDownlink,
        /// Cause
        error: Error,
    },
    /// Downlinks that can no longer be sent with their frame counters
    DownlinkQueueInvalidated {
        /// Invalidated downlinks
        downlinks: Vec<ApplicationDownlink>,
        /// Last network downlink frame counter
        last_f_cnt_down: u32,
        /// Session the downlinks were queued for
        session_key_id: Vec<u8>,
    },
}

/// Application uplink addressed to a device
#[derive(Debug, Clone)]
pub struct ApplicationUp {
    /// Device identifiers
    pub ids: EndDeviceIdentifiers,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
    /// Payload
    pub message: ApplicationUpMessage,
}

impl ApplicationUp {
    /// New application uplink
    pub fn new(
        ids: &EndDeviceIdentifiers,
        correlation_ids: &[String],
        message: ApplicationUpMessage,
    ) -> Self {
        Self {
            ids: ids.clone(),
            correlation_ids: correlation_ids.to_vec(),
            message,
        }
    }
}

/// Receiver of application uplinks
#[async_trait]
pub trait ApplicationUplinkSink: Send + Sync {
    /// Submit application uplinks
    async fn submit(&self, ups: Vec<ApplicationUp>) -> Result<()>;
}

/// Per-application uplink streams
#[derive(Debug, Default)]
pub struct ApplicationLinks {
    links: Mutex<HashMap<String, mpsc::Sender<ApplicationUp>>>,
}

impl ApplicationLinks {
    /// No linked applications
    pub fn new() -> Self {
        Self::default()
    }

    /// Link an application; an existing link is closed
    pub fn link(&self, application_id: &str) -> mpsc::Receiver<ApplicationUp> {
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let previous = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(application_id.to_string(), tx);
        if previous.is_some() {
            debug!(application_id, "Replaced application link");
        }
        rx
    }

    /// Remove the link of an application
    pub fn unlink(&self, application_id: &str) {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(application_id);
    }

    fn sender(&self, application_id: &str) -> Option<mpsc::Sender<ApplicationUp>> {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(application_id)
            .cloned()
    }
}

#[async_trait]
impl ApplicationUplinkSink for ApplicationLinks {
    async fn submit(&self, ups: Vec<ApplicationUp>) -> Result<()> {
        for up in ups {
            let app = up.ids.application_id.clone();
            let Some(tx) = self.sender(&app) else {
                debug!(application_id = %app, "No application link, dropping uplink");
                continue;
            };
            if tx.send(up).await.is_err() {
                debug!(application_id = %app, "Application link closed, dropping uplink");
                let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
                if links.get(&app).is_some_and(|cur| cur.same_channel(&tx)) {
                    links.remove(&app);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up(app: &str) -> ApplicationUp {
        ApplicationUp::new(
            &EndDeviceIdentifiers::new(app, "dev"),
            &[],
            ApplicationUpMessage::JoinAccept {
                session_key_id: vec![1],
                app_s_key: None,
                received_at: SystemTime::UNIX_EPOCH,
            },
        )
    }

    #[tokio::test]
    async fn test_second_link_closes_first() {
        let links = ApplicationLinks::new();
        let mut first = links.link("app");
        let mut second = links.link("app");
        links.submit(vec![up("app"), up("other")]).await.unwrap();
        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_some());
    }
}
