//! Node runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

use gavel_core::NodeId;
use gavel_raft::RaftConfig;

/// Full configuration surface for one Gavel node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Address to bind for the peer protocol.
    pub protocol_addr: SocketAddr,
    /// Address the client-facing request router binds. The consensus core
    /// does not open it; the outer layer does.
    pub router_addr: SocketAddr,
    /// The other nodes in the cluster.
    pub peers: Vec<PeerConfig>,
    /// Timer intervals.
    pub timing: TimingConfig,
    /// Opaque credentials passed through to the back end.
    pub backend_credentials: Option<String>,
    /// Run without a back end: the applier advances but executes nothing.
    pub disabled_backend: bool,
    /// Enable verbose diagnostics.
    pub debug: bool,
}

impl NodeConfig {
    /// Creates a configuration with default timing and no peers.
    #[must_use]
    pub fn new(node_id: NodeId, protocol_addr: SocketAddr, router_addr: SocketAddr) -> Self {
        Self {
            node_id,
            protocol_addr,
            router_addr,
            peers: Vec::new(),
            timing: TimingConfig::default(),
            backend_credentials: None,
            disabled_backend: false,
            debug: false,
        }
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            addr: addr.into(),
        });
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Returns all cluster node IDs including this one, sorted.
    #[must_use]
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.node_id];
        for peer in &self.peers {
            nodes.push(peer.node_id);
        }
        nodes.sort_by_key(|n| n.get());
        nodes
    }

    /// Builds the consensus-layer configuration.
    #[must_use]
    pub fn raft_config(&self) -> RaftConfig {
        let mut config = RaftConfig::new(self.node_id, self.cluster_nodes());
        config.leader_timeout_min = self.timing.leader_timeout_min;
        config.leader_timeout_max = self.timing.leader_timeout_max;
        config.election_timeout_min = self.timing.election_timeout_min;
        config.election_timeout_max = self.timing.election_timeout_max;
        config.heartbeat_interval = self.timing.heartbeat_interval;
        config.min_election_delay = self.timing.min_election_delay;
        config
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err("peer list must not contain this node");
        }
        self.raft_config().validate()
    }
}

/// Address book entry for one peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The peer's node ID.
    pub node_id: NodeId,
    /// The peer's protocol address (`host:port`, resolved at connect time).
    pub addr: String,
}

/// Timer intervals for one node.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Minimum leader timeout (follower waiting for leader traffic).
    pub leader_timeout_min: Duration,
    /// Maximum leader timeout.
    pub leader_timeout_max: Duration,
    /// Minimum election timeout (candidate waiting for a verdict).
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Fixed per-peer heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Elections starting earlier than this after the previous one are
    /// suppressed.
    pub min_election_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            leader_timeout_min: Duration::from_millis(150),
            leader_timeout_max: Duration::from_millis(300),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            min_election_delay: Duration::from_millis(100),
        }
    }
}

impl TimingConfig {
    /// Timing suitable for tests (fast timeouts).
    #[must_use]
    pub fn fast_for_testing() -> Self {
        Self {
            leader_timeout_min: Duration::from_millis(50),
            leader_timeout_max: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            min_election_delay: Duration::from_millis(30),
        }
    }
}
