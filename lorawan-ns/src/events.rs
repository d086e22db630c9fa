//! Network server events
//!
//! Every processing step and every drop produces an [`Event`] carrying the
//! device identifiers, the correlation identifiers and, for failures, the
//! error. Events are handed to an injected [`EventSink`]; publishing is
//! fire-and-forget.

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::device::EndDeviceIdentifiers;
use crate::error::Error;

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventDefinition {
    /// Stable event name
    pub name: &'static str,
    /// Human-readable description
    pub description: &'static str,
}

macro_rules! definitions {
    ($($(#[$doc:meta])* $id:ident = $name:literal, $desc:literal;)*) => {
        $(
            $(#[$doc])*
            pub const $id: EventDefinition = EventDefinition {
                name: $name,
                description: $desc,
            };
        )*
    };
}

definitions! {
    /// Data uplink received
    RECEIVE_DATA_UPLINK = "ns.up.data.receive", "receive data message";
    /// Duplicate of an uplink being deduplicated
    RECEIVE_DUPLICATE = "ns.up.receive_duplicate", "receive duplicate message";
    /// Data uplink dropped
    DROP_DATA_UPLINK = "ns.up.data.drop", "drop data message";
    /// Data uplink processed
    PROCESS_DATA_UPLINK = "ns.up.data.process", "successfully processed data message";
    /// Join-request received
    RECEIVE_JOIN_REQUEST = "ns.up.join.receive", "receive join-request";
    /// Join-request dropped
    DROP_JOIN_REQUEST = "ns.up.join.drop", "drop join-request";
    /// Join-request accepted by the Join Server
    PROCESS_JOIN_REQUEST = "ns.up.join.process", "successfully processed join-request";
    /// Join-request sent to a Join Server
    FORWARD_JOIN_REQUEST = "ns.up.join.forward", "forward join-request to Join Server";
    /// Rejoin-request received
    RECEIVE_REJOIN_REQUEST = "ns.up.rejoin.receive", "receive rejoin-request";
    /// Rejoin-request dropped
    DROP_REJOIN_REQUEST = "ns.up.rejoin.drop", "drop rejoin-request";
    /// Data downlink scheduled
    SCHEDULE_DATA_DOWNLINK = "ns.down.data.schedule.success", "successfully scheduled data downlink";
    /// Data downlink scheduling failed
    SCHEDULE_DATA_DOWNLINK_FAIL = "ns.down.data.schedule.fail", "failed to schedule data downlink";
    /// Join-accept scheduled
    SCHEDULE_JOIN_ACCEPT = "ns.down.join.schedule.success", "successfully scheduled join-accept";
    /// Join-accept scheduling failed
    SCHEDULE_JOIN_ACCEPT_FAIL = "ns.down.join.schedule.fail", "failed to schedule join-accept";
    /// Downlink transmitted by a gateway
    TRANSMIT_DOWNLINK = "ns.down.transmission.success", "successfully transmitted downlink";
    /// MAC command answered by the device
    MAC_ANSWER = "ns.mac.answer", "receive MAC command answer";
    /// MAC command request from the device
    MAC_REQUEST = "ns.mac.request", "receive MAC command request";
    /// MAC command enqueued for the device
    MAC_ENQUEUE = "ns.mac.enqueue", "enqueue MAC command";
    /// Pending requests left unanswered by an uplink
    MAC_UNANSWERED = "ns.mac.unanswered", "MAC command buffer not fully answered";
    /// MAC command rejected
    MAC_REJECT = "ns.mac.reject", "MAC command rejected";
    /// Device class changed
    CLASS_SWITCH = "ns.class.switch", "switch device class";
    /// Pending session promoted
    SESSION_PROMOTE = "ns.session.promote", "promote pending session";
}

/// A published event
#[derive(Debug, Clone)]
pub struct Event {
    /// Event type
    pub definition: EventDefinition,
    /// Device the event relates to
    pub ids: EndDeviceIdentifiers,
    /// Correlation identifiers
    pub correlation_ids: Vec<String>,
    /// Free-form detail, such as a MAC command identifier
    pub detail: Option<String>,
    /// Failure cause
    pub error: Option<Error>,
}

impl Event {
    /// New event without detail
    pub fn new(
        definition: EventDefinition,
        ids: &EndDeviceIdentifiers,
        correlation_ids: &[String],
    ) -> Self {
        Self {
            definition,
            ids: ids.clone(),
            correlation_ids: correlation_ids.to_vec(),
            detail: None,
            error: None,
        }
    }

    /// Attach a detail
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach an error
    pub fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }

    /// Event name
    pub fn name(&self) -> &'static str {
        self.definition.name
    }
}

/// Receiver of published events
pub trait EventSink: Send + Sync {
    /// Publish a batch of events
    fn publish(&self, events: Vec<Event>);
}

/// Event sink that logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, events: Vec<Event>) {
        for ev in events {
            let dev = ev.ids.uid();
            match &ev.error {
                Some(err) => warn!(
                    event = ev.definition.name,
                    dev_uid = %dev,
                    correlation_ids = ?ev.correlation_ids,
                    error = %err,
                    "{}", ev.definition.description
                ),
                None => debug!(
                    event = ev.definition.name,
                    dev_uid = %dev,
                    detail = ev.detail.as_deref().unwrap_or(""),
                    "{}", ev.definition.description
                ),
            }
        }
    }
}

/// Event sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all events published so far
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Names of the events published so far, without taking them
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Event::name)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, events: Vec<Event>) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(events);
    }
}
