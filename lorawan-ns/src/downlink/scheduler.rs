//! Downlink scheduler
//!
//! Paths are tried group by group. Within a group, consecutive paths served
//! by the same peer are merged into one attempt. The first successful
//! attempt ends scheduling: a downlink is transmitted at most once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, ErrorKind, PathErrorDetails, Reason, Result};
use crate::messages::{DownlinkMessage, DownlinkPath};
use crate::peers::Peers;

/// Maximum number of paths handed to a peer in one attempt
pub const MAX_PATHS_PER_ATTEMPT: usize = 3;

/// Path errors that make an absolute time downlink fail terminally
const NON_RETRYABLE_ABSOLUTE_TIME: [ErrorKind; 4] = [
    ErrorKind::Aborted,
    ErrorKind::ResourceExhausted,
    ErrorKind::FailedPrecondition,
    ErrorKind::AlreadyExists,
];

/// Path errors that make a fixed path downlink fail terminally
const NON_RETRYABLE_FIXED_PATH: [ErrorKind; 3] = [
    ErrorKind::NotFound,
    ErrorKind::DataLoss,
    ErrorKind::FailedPrecondition,
];

/// Peer a downlink is handed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Gateway Server, by name
    GatewayServer(String),
    /// Packet Broker Agent
    PacketBroker,
}

/// Successfully scheduled downlink
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRecord {
    /// Peer that accepted the downlink
    pub target: Target,
    /// Delay reported by the peer
    pub delay: Duration,
    /// Expected transmission time
    pub transmit_at: SystemTime,
    /// Path the peer used, if reported
    pub downlink_path: Option<DownlinkPath>,
}

#[derive(Debug)]
struct Attempt {
    target: Target,
    paths: Vec<DownlinkPath>,
}

/// Whether a scheduling failure is final for the downlink
///
/// All path errors must be non-retryable, for the absolute time set when
/// the request carries an absolute time, or for the fixed path set when it
/// carries fixed paths.
pub fn is_terminal(path_errors: &[PathErrorDetails], absolute_time: bool, fixed_paths: bool) -> bool {
    if path_errors.is_empty() {
        return false;
    }
    let all_in = |set: &[ErrorKind]| path_errors.iter().all(|e| set.contains(&e.kind));
    (absolute_time && all_in(&NON_RETRYABLE_ABSOLUTE_TIME))
        || (fixed_paths && all_in(&NON_RETRYABLE_FIXED_PATH))
}

/// Schedules downlinks on Gateway Servers and the Packet Broker Agent
pub struct Scheduler {
    peers: Peers,
    peer_timeout: Duration,
    peering_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("peers", &self.peers)
            .field("peer_timeout", &self.peer_timeout)
            .field("peering_delay", &self.peering_delay)
            .finish()
    }
}

impl Scheduler {
    /// New scheduler
    pub fn new(peers: Peers, peer_timeout: Duration, peering_delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            peers,
            peer_timeout,
            peering_delay,
            clock,
        }
    }

    /// Registered peers
    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    fn attempts(&self, paths: &[DownlinkPath], errors: &mut Vec<PathErrorDetails>) -> Vec<Attempt> {
        let mut attempts: Vec<Attempt> = Vec::new();
        for path in paths {
            let target = if path.packet_broker {
                if self.peers.packet_broker().is_none() {
                    errors.push(PathErrorDetails {
                        kind: ErrorKind::NotFound,
                        message: "no Packet Broker Agent".into(),
                    });
                    continue;
                }
                Target::PacketBroker
            } else {
                match self.peers.gateway_server(&path.gateway_id) {
                    Some((name, _)) => Target::GatewayServer(name),
                    None => {
                        errors.push(PathErrorDetails {
                            kind: ErrorKind::NotFound,
                            message: format!("no Gateway Server for `{}`", path.gateway_id),
                        });
                        continue;
                    }
                }
            };
            match attempts.last_mut() {
                Some(last) if last.target == target && last.paths.len() < MAX_PATHS_PER_ATTEMPT => {
                    last.paths.push(path.clone());
                }
                _ => attempts.push(Attempt {
                    target,
                    paths: vec![path.clone()],
                }),
            }
        }
        attempts
    }

    async fn try_attempt(&self, msg: &DownlinkMessage, attempt: &Attempt) -> Result<ScheduledRecord> {
        let mut msg = msg.clone();
        msg.request.downlink_paths = attempt.paths.clone();
        let now = self.clock.now();
        match &attempt.target {
            Target::GatewayServer(name) => {
                let (_, gs) = self
                    .peers
                    .gateway_server(&attempt.paths[0].gateway_id)
                    .ok_or_else(|| Error::not_found(Reason::Peer, format!("Gateway Server `{name}` gone")))?;
                let resp = tokio::time::timeout(self.peer_timeout, gs.schedule_downlink(msg))
                    .await
                    .map_err(|_| timeout_error())??;
                Ok(ScheduledRecord {
                    target: attempt.target.clone(),
                    delay: resp.delay,
                    transmit_at: now + resp.delay,
                    downlink_path: resp.downlink_path.or_else(|| attempt.paths.first().cloned()),
                })
            }
            Target::PacketBroker => {
                let pba = self
                    .peers
                    .packet_broker()
                    .ok_or_else(|| Error::not_found(Reason::Peer, "no Packet Broker Agent"))?;
                tokio::time::timeout(self.peer_timeout, pba.publish_downlink(msg))
                    .await
                    .map_err(|_| timeout_error())??;
                Ok(ScheduledRecord {
                    target: Target::PacketBroker,
                    delay: self.peering_delay,
                    transmit_at: now + self.peering_delay,
                    downlink_path: attempt.paths.first().cloned(),
                })
            }
        }
    }

    /// Schedule `msg` on the first path group that accepts it
    ///
    /// `fixed_paths` tells whether the groups were set by the application
    /// rather than derived from uplink metadata. A terminal failure (see
    /// [`is_terminal`]) is `FailedPrecondition` with reason
    /// `ApplicationDownlinkFailed`; any other failure is `Unavailable`.
    /// Both carry the per-path errors.
    pub async fn schedule_by_paths(
        &self,
        msg: &DownlinkMessage,
        groups: &BTreeMap<u32, Vec<DownlinkPath>>,
        fixed_paths: bool,
    ) -> Result<ScheduledRecord> {
        let mut path_errors = Vec::new();
        let mut tried = false;
        for (group, paths) in groups {
            for attempt in self.attempts(paths, &mut path_errors) {
                tried = true;
                match self.try_attempt(msg, &attempt).await {
                    Ok(record) => {
                        debug!(
                            group,
                            target = ?record.target,
                            delay = ?record.delay,
                            "Scheduled downlink"
                        );
                        return Ok(record);
                    }
                    Err(err) => {
                        warn!(group, target = ?attempt.target, error = %err, "Downlink attempt failed");
                        if err.path_errors().is_empty() {
                            path_errors.extend(attempt.paths.iter().map(|_| PathErrorDetails {
                                kind: err.kind(),
                                message: err.message().to_string(),
                            }));
                        } else {
                            path_errors.extend(err.path_errors().iter().cloned());
                        }
                    }
                }
            }
        }
        if !tried && path_errors.is_empty() {
            return Err(Error::failed_precondition(
                Reason::NoDownlinkPath,
                "no downlink path available",
            ));
        }
        let absolute_time = msg.request.absolute_time.is_some();
        if is_terminal(&path_errors, absolute_time, fixed_paths) {
            return Err(Error::failed_precondition(
                Reason::ApplicationDownlinkFailed,
                "all downlink paths failed terminally",
            )
            .with_path_errors(path_errors));
        }
        Err(Error::unavailable(Reason::SchedulingFailed, "all downlink paths failed")
            .with_path_errors(path_errors))
    }
}

fn timeout_error() -> Error {
    Error::new(ErrorKind::DeadlineExceeded, Reason::Timeout, "peer call timed out")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::MockClock;
    use crate::config::device::EndDeviceIdentifiers;
    use crate::config::TxPriority;
    use crate::device::DeviceClass;
    use crate::messages::{ScheduleResponse, TxRequest};
    use crate::peers::{GatewayServer, PacketBrokerAgent};

    struct Gs {
        result: Result<ScheduleResponse>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl GatewayServer for Gs {
        async fn schedule_downlink(&self, msg: DownlinkMessage) -> Result<ScheduleResponse> {
            self.calls
                .lock()
                .unwrap()
                .push(msg.request.downlink_paths.len());
            self.result.clone()
        }
    }

    struct Pba;

    #[async_trait]
    impl PacketBrokerAgent for Pba {
        async fn publish_downlink(&self, _msg: DownlinkMessage) -> Result<()> {
            Ok(())
        }
    }

    fn gs(result: Result<ScheduleResponse>) -> Arc<Gs> {
        Arc::new(Gs {
            result,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn message(absolute_time: Option<SystemTime>) -> DownlinkMessage {
        DownlinkMessage {
            raw_payload: vec![0x60],
            end_device_ids: EndDeviceIdentifiers::new("app", "dev"),
            request: TxRequest {
                class: DeviceClass::C,
                downlink_paths: Vec::new(),
                rx1_delay: Duration::from_secs(1),
                rx1: None,
                rx2: None,
                priority: TxPriority::Normal,
                absolute_time,
                frequency_plan_id: "EU_863_870".into(),
            },
            correlation_ids: Vec::new(),
        }
    }

    fn pb_path() -> DownlinkPath {
        DownlinkPath {
            gateway_id: "pb".into(),
            antenna_index: 0,
            uplink_token: Some(vec![1]),
            packet_broker: true,
        }
    }

    #[tokio::test]
    async fn test_fallback_to_packet_broker() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = Arc::new(MockClock::new(t0));
        let exhausted = gs(Err(Error::new(
            ErrorKind::ResourceExhausted,
            Reason::Peer,
            "duty cycle",
        )));
        let peers = Peers::new()
            .with_gateway_server("gs", exhausted.clone())
            .with_packet_broker(Arc::new(Pba));
        let scheduler = Scheduler::new(peers, Duration::from_secs(5), Duration::from_secs(2), clock);

        let groups = BTreeMap::from([(0, vec![DownlinkPath::fixed("gw", 0)]), (1, vec![pb_path()])]);
        let record = scheduler
            .schedule_by_paths(&message(None), &groups, false)
            .await
            .unwrap();
        assert_eq!(record.target, Target::PacketBroker);
        assert_eq!(record.transmit_at, t0 + Duration::from_secs(2));
        assert_eq!(exhausted.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merges_paths_and_stops_at_first_success() {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let ok = gs(Ok(ScheduleResponse {
            delay: Duration::from_millis(500),
            downlink_path: None,
        }));
        let peers = Peers::new().with_gateway_server("gs", ok.clone());
        let scheduler = Scheduler::new(peers, Duration::from_secs(5), Duration::ZERO, clock);
        let paths: Vec<_> = (0..4).map(|i| DownlinkPath::fixed(format!("gw{i}"), 0)).collect();
        let groups = BTreeMap::from([(0, paths.clone()), (1, paths)]);
        scheduler
            .schedule_by_paths(&message(None), &groups, false)
            .await
            .unwrap();
        assert_eq!(*ok.calls.lock().unwrap(), vec![MAX_PATHS_PER_ATTEMPT]);
    }

    #[tokio::test]
    async fn test_terminal_failure_classification() {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let busy = gs(Err(Error::new(ErrorKind::ResourceExhausted, Reason::Peer, "busy")));
        let peers = Peers::new().with_gateway_server("gs", busy);
        let scheduler = Scheduler::new(peers, Duration::from_secs(5), Duration::ZERO, clock);
        let groups = BTreeMap::from([(0, vec![DownlinkPath::fixed("gw", 0)])]);

        let err = scheduler
            .schedule_by_paths(&message(Some(SystemTime::UNIX_EPOCH)), &groups, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(err.reason(), Reason::ApplicationDownlinkFailed);
        assert_eq!(err.path_errors().len(), 1);

        let err = scheduler
            .schedule_by_paths(&message(None), &groups, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_no_paths() {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let scheduler = Scheduler::new(Peers::new(), Duration::from_secs(5), Duration::ZERO, clock);
        let err = scheduler
            .schedule_by_paths(&message(None), &BTreeMap::new(), false)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Reason::NoDownlinkPath);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_timeout() {
        struct Slow;
        #[async_trait]
        impl GatewayServer for Slow {
            async fn schedule_downlink(&self, _msg: DownlinkMessage) -> Result<ScheduleResponse> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(Error::internal(Reason::Peer, "unreachable"))
            }
        }
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let peers = Peers::new().with_gateway_server("gs", Arc::new(Slow));
        let scheduler = Scheduler::new(peers, Duration::from_secs(1), Duration::ZERO, clock);
        let groups = BTreeMap::from([(0, vec![DownlinkPath::fixed("gw", 0)])]);
        let err = scheduler
            .schedule_by_paths(&message(None), &groups, false)
            .await
            .unwrap_err();
        assert_eq!(err.path_errors()[0].kind, ErrorKind::DeadlineExceeded);
    }
}
