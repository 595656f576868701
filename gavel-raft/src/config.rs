//! Per-node consensus configuration.

use std::time::Duration;

use gavel_core::limits::CLUSTER_SIZE_MAX;
use gavel_core::NodeId;

/// Configuration for one consensus node.
///
/// Cluster membership is fixed for the life of the node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// IDs of all nodes in the cluster, including this one.
    pub cluster: Vec<NodeId>,

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

    /// Elections started earlier than this after the previous election
    /// started are suppressed.
    pub min_election_delay: Duration,
}

impl RaftConfig {
    /// Creates a configuration with default timing.
    ///
    /// # Panics
    /// Panics if the cluster is empty, too large, or does not contain
    /// `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId, cluster: Vec<NodeId>) -> Self {
        assert!(!cluster.is_empty(), "cluster cannot be empty");
        assert!(
            cluster.len() <= CLUSTER_SIZE_MAX,
            "cluster size {} exceeds maximum {}",
            cluster.len(),
            CLUSTER_SIZE_MAX
        );
        assert!(cluster.contains(&node_id), "node_id must be in cluster");

        Self {
            node_id,
            cluster,
            leader_timeout_min: Duration::from_millis(150),
            leader_timeout_max: Duration::from_millis(300),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            min_election_delay: Duration::from_millis(100),
        }
    }

    /// Timing suitable for tests (fast timeouts).
    #[must_use]
    pub fn fast_for_testing(node_id: NodeId, cluster: Vec<NodeId>) -> Self {
        let mut config = Self::new(node_id, cluster);
        config.leader_timeout_min = Duration::from_millis(50);
        config.leader_timeout_max = Duration::from_millis(100);
        config.election_timeout_min = Duration::from_millis(50);
        config.election_timeout_max = Duration::from_millis(100);
        config.heartbeat_interval = Duration::from_millis(20);
        config.min_election_delay = Duration::from_millis(30);
        config
    }

    /// Returns the number of nodes in the cluster.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.cluster.len()
    }

    /// Returns the majority threshold.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    /// Returns the other nodes in the cluster.
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.cluster
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.leader_timeout_min > self.leader_timeout_max {
            return Err("leader timeout min > max");
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err("election timeout min > max");
        }
        if self.heartbeat_interval >= self.leader_timeout_min {
            return Err("heartbeat interval must be less than leader timeout");
        }
        Ok(())
    }
}
