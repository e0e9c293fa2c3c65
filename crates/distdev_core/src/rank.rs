//! Participant identities.
//!
//! Workers occupy ranks `0..N`, the controller occupies rank `N`, so the
//! world size is always `N + 1`.

use crate::error::{ClusterError, ClusterResult};
use serde::{Deserialize, Serialize};

/// Mesh name of the controller
pub const CONTROLLER_NAME: &str = "controller";

/// Rank of a participant in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rank(u32);

impl Rank {
    /// Create a rank from its raw value
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Get the rank as an index into per-worker collections
    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Rank {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shape of a cluster: N workers plus one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    workers: u32,
}

impl Topology {
    /// Create a topology with `workers` worker ranks
    ///
    /// # Errors
    ///
    /// Returns error if `workers` is zero
    pub fn new(workers: u32) -> ClusterResult<Self> {
        if workers == 0 {
            return Err(ClusterError::Config {
                reason: "worker count must be at least 1".to_string(),
            });
        }
        Ok(Self { workers })
    }

    /// Recover the topology from a world size (workers + controller)
    ///
    /// # Errors
    ///
    /// Returns error if the world size leaves no room for a worker
    pub fn from_world_size(world_size: u32) -> ClusterResult<Self> {
        Self::new(world_size.saturating_sub(1))
    }

    /// Number of workers
    #[must_use]
    pub const fn workers(&self) -> u32 {
        self.workers
    }

    /// Number of participants including the controller
    #[must_use]
    pub const fn world_size(&self) -> u32 {
        self.workers + 1
    }

    /// The controller's rank (always the last one)
    #[must_use]
    pub const fn controller(&self) -> Rank {
        Rank(self.workers)
    }

    /// Whether `rank` names a worker
    #[must_use]
    pub const fn is_worker(&self, rank: Rank) -> bool {
        rank.0 < self.workers
    }

    /// Iterate over worker ranks in ascending order
    pub fn worker_ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.workers).map(Rank)
    }

    /// Mesh name of a participant: `w{rank}` for workers, `controller` otherwise
    #[must_use]
    pub fn peer_name(&self, rank: Rank) -> String {
        if self.is_worker(rank) {
            worker_name(rank)
        } else {
            CONTROLLER_NAME.to_string()
        }
    }
}

/// Mesh name of a worker
#[must_use]
pub fn worker_name(rank: Rank) -> String {
    format!("w{}", rank.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_world_size() {
        let topo = Topology::new(4).unwrap();
        assert_eq!(topo.workers(), 4);
        assert_eq!(topo.world_size(), 5);
        assert_eq!(topo.controller(), Rank::new(4));
    }

    #[test]
    fn test_topology_rejects_zero_workers() {
        let err = Topology::new(0).unwrap_err();
        assert!(matches!(err, ClusterError::Config { .. }));
        assert!(Topology::from_world_size(1).is_err());
    }

    #[test]
    fn test_topology_from_world_size() {
        let topo = Topology::from_world_size(3).unwrap();
        assert_eq!(topo.workers(), 2);
    }

    #[test]
    fn test_peer_names() {
        let topo = Topology::new(2).unwrap();
        assert_eq!(topo.peer_name(Rank::new(0)), "w0");
        assert_eq!(topo.peer_name(Rank::new(1)), "w1");
        assert_eq!(topo.peer_name(Rank::new(2)), "controller");
    }

    #[test]
    fn test_worker_ranks_ascending() {
        let topo = Topology::new(3).unwrap();
        let ranks: Vec<u32> = topo.worker_ranks().map(|r| r.as_u32()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(!topo.is_worker(topo.controller()));
    }
}
