//! Scheduled downlink matcher
//!
//! Scheduled downlinks are remembered by their downlink correlation
//! identifier for a short time, so that the TX acknowledgment of a gateway
//! can be resolved to the device and application downlink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::clock::Clock;
use crate::config::device::EndDeviceIdentifiers;
use crate::device::ApplicationDownlink;
use crate::error::{Error, ErrorKind, Reason, Result};

/// Prefix of the correlation identifier assigned to every scheduled downlink
pub const DOWNLINK_CORRELATION_PREFIX: &str = "ns:downlink:";

/// New downlink correlation identifier
pub fn new_downlink_correlation_id() -> String {
    format!("{DOWNLINK_CORRELATION_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Downlink awaiting a TX acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledDownlink {
    /// Device identifiers
    pub ids: EndDeviceIdentifiers,
    /// Correlation identifiers of the downlink message
    pub correlation_ids: Vec<String>,
    /// Application downlink carried, if any
    pub application_downlink: Option<ApplicationDownlink>,
    /// Expected transmission time
    pub transmit_at: SystemTime,
}

/// TTL map from downlink correlation identifier to scheduled downlink
pub struct ScheduledDownlinkMatcher {
    entries: Mutex<HashMap<String, (ScheduledDownlink, SystemTime)>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ScheduledDownlinkMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledDownlinkMatcher")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ScheduledDownlinkMatcher {
    /// Matcher keeping entries for `ttl`
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Remember a scheduled downlink
    ///
    /// Fails with `AlreadyExists` if its downlink correlation identifier is
    /// already tracked.
    pub fn add(&self, down: ScheduledDownlink) -> Result<()> {
        let key = down
            .correlation_ids
            .iter()
            .find(|id| id.starts_with(DOWNLINK_CORRELATION_PREFIX))
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(Reason::Decode, "downlink has no downlink correlation id")
            })?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, expires)| *expires > now);
        if entries.contains_key(&key) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                Reason::DuplicateDownlink,
                format!("downlink `{key}` already scheduled"),
            ));
        }
        entries.insert(key, (down, now + self.ttl));
        Ok(())
    }

    /// Take the downlink one of `correlation_ids` refers to
    pub fn take(&self, correlation_ids: &[String]) -> Option<ScheduledDownlink> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, expires)| *expires > now);
        let found = correlation_ids
            .iter()
            .filter(|id| id.starts_with(DOWNLINK_CORRELATION_PREFIX))
            .find_map(|id| entries.remove(id));
        if found.is_none() {
            trace!("No scheduled downlink matches acknowledgment");
        }
        found.map(|(down, _)| down)
    }

    /// Number of tracked downlinks, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn scheduled(cid: &str) -> ScheduledDownlink {
        ScheduledDownlink {
            ids: EndDeviceIdentifiers::new("app", "dev"),
            correlation_ids: vec!["ns:uplink:1".into(), cid.into()],
            application_downlink: None,
            transmit_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_match_and_expiry() {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let matcher = ScheduledDownlinkMatcher::new(Duration::from_secs(10), clock.clone());
        matcher.add(scheduled("ns:downlink:a")).unwrap();
        matcher.add(scheduled("ns:downlink:b")).unwrap();
        let err = matcher.add(scheduled("ns:downlink:a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let found = matcher.take(&["gs:1".into(), "ns:downlink:a".into()]);
        assert!(found.is_some());
        assert!(matcher.take(&["ns:downlink:a".into()]).is_none());

        clock.advance(Duration::from_secs(11));
        assert!(matcher.take(&["ns:downlink:b".into()]).is_none());
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = new_downlink_correlation_id();
        assert!(a.starts_with(DOWNLINK_CORRELATION_PREFIX));
        assert_ne!(a, new_downlink_correlation_id());
    }
}
