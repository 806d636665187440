//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::geo::NetworkEndpoint;
use crate::identity::NodeInfo;

/// Everything a node needs to run. `node_info` is immutable for the
/// lifetime of the process except for the external-address update path.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Self's identity, contact endpoints and location.
    pub node_info: NodeInfo,
    /// Listening port for the local service / client protocol.
    pub local_service_port: u16,
    /// Cap on Neighbour entries in the store.
    pub neighbourhood_target_size: usize,
    /// Scale factor K of the personal-space bubble, in kilometres.
    pub bubble_scale_km: f32,
    /// TTL applied by store/update when the entry expires.
    pub db_expiration_period: Duration,
    /// Cadence of the expiration sweep and relation renewal.
    pub db_maintenance_period: Duration,
    /// Cadence of the tighter neighbour-only renewal sweep.
    pub neighbourhood_maintenance_period: Duration,
    /// Cadence of random-area discovery.
    pub discovery_period: Duration,
    /// Default deadline for a single request/response exchange.
    pub request_expiration_period: Duration,
    /// Endpoints contacted during join, tried in shuffled order.
    pub seed_nodes: Vec<NetworkEndpoint>,
    /// Directory of the persistent store.
    pub db_path: PathBuf,
    /// Log destination, consumed by the embedding process.
    pub log_path: PathBuf,
    /// Accept loopback peer endpoints. The overlay normally refuses them;
    /// single-machine deployments and tests need them.
    pub allow_local_peers: bool,
}

impl NodeConfig {
    pub fn new(node_info: NodeInfo, db_path: impl Into<PathBuf>) -> Self {
        let local_service_port = node_info.profile.client_endpoint.port;
        Self {
            node_info,
            local_service_port,
            neighbourhood_target_size: 5,
            bubble_scale_km: 25.0,
            db_expiration_period: Duration::from_secs(24 * 60 * 60),
            db_maintenance_period: Duration::from_secs(60),
            neighbourhood_maintenance_period: Duration::from_secs(15),
            discovery_period: Duration::from_secs(5 * 60),
            request_expiration_period: Duration::from_secs(10),
            seed_nodes: Vec::new(),
            db_path: db_path.into(),
            log_path: PathBuf::from("meridian.log"),
            allow_local_peers: false,
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<NetworkEndpoint>) -> Self {
        self.seed_nodes = seeds;
        self
    }

    pub fn with_local_peers(mut self) -> Self {
        self.allow_local_peers = true;
        self
    }
}
