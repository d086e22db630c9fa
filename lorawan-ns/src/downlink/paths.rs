//! Downlink path selection
//!
//! Paths come from the reception metadata of the last uplink. They are
//! ranked by a signal quality estimate and partitioned so that gateways
//! without constraints are tried first and Packet Broker gateways last.

use std::collections::BTreeMap;

use crate::device::ClassBcGateway;
use crate::messages::{DownlinkPath, PathConstraint, RxMetadata};

/// RSSI corrected by the SNR, in dBm
pub fn wanted_rssi(channel_rssi: f32, snr: f32) -> f32 {
    if snr <= -5.0 {
        channel_rssi + snr
    } else if snr < 10.0 {
        channel_rssi + snr / 3.0 - 10.0 / 3.0
    } else {
        channel_rssi
    }
}

/// Ranked downlink paths for the given reception metadata
///
/// Gateways that must never be used and metadata without an uplink token
/// are discarded.
pub fn from_metadata(md: &[RxMetadata]) -> Vec<DownlinkPath> {
    let mut ranked: Vec<&RxMetadata> = md
        .iter()
        .filter(|m| m.downlink_path_constraint != PathConstraint::Never)
        .filter(|m| !m.uplink_token.is_empty())
        .collect();
    ranked.sort_by(|a, b| {
        wanted_rssi(b.channel_rssi, b.snr).total_cmp(&wanted_rssi(a.channel_rssi, a.snr))
    });

    let (tail, local): (Vec<_>, Vec<_>) = ranked.into_iter().partition(|m| m.packet_broker);
    let (head, body): (Vec<_>, Vec<_>) = local
        .into_iter()
        .partition(|m| m.downlink_path_constraint == PathConstraint::None);
    head.into_iter()
        .chain(body)
        .chain(tail)
        .map(|m| DownlinkPath {
            gateway_id: m.gateway_id.clone(),
            antenna_index: m.antenna_index,
            uplink_token: Some(m.uplink_token.clone()),
            packet_broker: m.packet_broker,
        })
        .collect()
}

/// Fixed class B/C gateways grouped by attempt group
pub fn group_fixed(gateways: &[ClassBcGateway]) -> BTreeMap<u32, Vec<DownlinkPath>> {
    let mut groups: BTreeMap<u32, Vec<DownlinkPath>> = BTreeMap::new();
    for gw in gateways {
        groups.entry(gw.group_index).or_default().push(gw.path());
    }
    groups
}
