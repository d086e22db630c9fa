//! Remote peers
//!
//! Gateway Servers and the Packet Broker Agent transmit downlinks; Join
//! Servers answer join-requests. All calls are async and bounded by the
//! configured peer timeout at the call site.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, ErrorKind, Reason, Result};
use crate::messages::{DownlinkMessage, JoinRequest, JoinResponse, ScheduleResponse};

/// Gateway Server reachable from the network server
#[async_trait]
pub trait GatewayServer: Send + Sync {
    /// Schedule a downlink on one of the request paths
    async fn schedule_downlink(&self, msg: DownlinkMessage) -> Result<ScheduleResponse>;
}

/// Packet Broker Agent forwarding downlinks to foreign gateways
#[async_trait]
pub trait PacketBrokerAgent: Send + Sync {
    /// Publish a downlink; delivery is asynchronous
    async fn publish_downlink(&self, msg: DownlinkMessage) -> Result<()>;
}

/// Join Server
#[async_trait]
pub trait JoinServer: Send + Sync {
    /// Handle a join-request
    async fn handle_join(&self, req: JoinRequest) -> Result<JoinResponse>;
}

/// Registered peers
#[derive(Default, Clone)]
pub struct Peers {
    gateway_servers: HashMap<String, Arc<dyn GatewayServer>>,
    gateways: HashMap<String, String>,
    default_gateway_server: Option<String>,
    packet_broker: Option<Arc<dyn PacketBrokerAgent>>,
    cluster_join_server: Option<Arc<dyn JoinServer>>,
    interop_join_server: Option<Arc<dyn JoinServer>>,
}

impl std::fmt::Debug for Peers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peers")
            .field("gateway_servers", &self.gateway_servers.keys().collect::<Vec<_>>())
            .field("gateways", &self.gateways)
            .field("default_gateway_server", &self.default_gateway_server)
            .field("packet_broker", &self.packet_broker.is_some())
            .field("cluster_join_server", &self.cluster_join_server.is_some())
            .field("interop_join_server", &self.interop_join_server.is_some())
            .finish()
    }
}

impl Peers {
    /// No peers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Gateway Server; the first one becomes the default
    pub fn with_gateway_server(mut self, name: impl Into<String>, gs: Arc<dyn GatewayServer>) -> Self {
        let name = name.into();
        if self.default_gateway_server.is_none() {
            self.default_gateway_server = Some(name.clone());
        }
        self.gateway_servers.insert(name, gs);
        self
    }

    /// Route a gateway to a named Gateway Server
    pub fn with_gateway(mut self, gateway_id: impl Into<String>, server: impl Into<String>) -> Self {
        self.gateways.insert(gateway_id.into(), server.into());
        self
    }

    /// Register the Packet Broker Agent
    pub fn with_packet_broker(mut self, pba: Arc<dyn PacketBrokerAgent>) -> Self {
        self.packet_broker = Some(pba);
        self
    }

    /// Register the cluster-local Join Server
    pub fn with_cluster_join_server(mut self, js: Arc<dyn JoinServer>) -> Self {
        self.cluster_join_server = Some(js);
        self
    }

    /// Register the interoperability Join Server
    pub fn with_interop_join_server(mut self, js: Arc<dyn JoinServer>) -> Self {
        self.interop_join_server = Some(js);
        self
    }

    /// Gateway Server serving `gateway_id`, with its name
    pub fn gateway_server(&self, gateway_id: &str) -> Option<(String, Arc<dyn GatewayServer>)> {
        let name = self
            .gateways
            .get(gateway_id)
            .or(self.default_gateway_server.as_ref())?;
        let gs = self.gateway_servers.get(name)?;
        Some((name.clone(), gs.clone()))
    }

    /// Packet Broker Agent, if registered
    pub fn packet_broker(&self) -> Option<Arc<dyn PacketBrokerAgent>> {
        self.packet_broker.clone()
    }

    /// Forward a join-request, cluster Join Server first
    ///
    /// A `NotFound` answer falls through to the next Join Server; when none
    /// is left the result is `JoinServerNotFound`.
    pub async fn handle_join(&self, req: JoinRequest) -> Result<JoinResponse> {
        for (name, js) in [
            ("cluster", &self.cluster_join_server),
            ("interop", &self.interop_join_server),
        ] {
            let Some(js) = js else { continue };
            match js.handle_join(req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(join_server = name, error = %err, "Join Server does not know device");
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::not_found(
            Reason::JoinServerNotFound,
            "no Join Server handled the join-request",
        ))
    }
}
