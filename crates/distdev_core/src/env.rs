//! Bootstrap environment handed to every participant.
//!
//! Process workers receive it as environment variables; thread workers
//! receive the value directly.

use crate::backend::Backend;
use crate::error::{ClusterError, ClusterResult};
use crate::rank::{Rank, Topology};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Marks a process as a spawned worker
pub const ROLE_VAR: &str = "DISTDEV_ROLE";
/// Rendezvous host
pub const MASTER_ADDR_VAR: &str = "MASTER_ADDR";
/// Rendezvous port
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";
/// Participant rank
pub const RANK_VAR: &str = "RANK";
/// Rank on the local host (same as `RANK`; single-host clusters only)
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
/// Number of participants including the controller
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
/// Backend identifier
pub const BACKEND_VAR: &str = "DISTDEV_BACKEND";
/// Join deadline in milliseconds
pub const JOIN_TIMEOUT_VAR: &str = "DISTDEV_JOIN_TIMEOUT_MS";

const WORKER_ROLE: &str = "worker";

/// Default deadline for every bootstrap phase
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity and rendezvous address of one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapEnv {
    /// This participant's rank
    pub rank: Rank,
    /// Cluster shape
    pub topology: Topology,
    /// Rendezvous host
    pub master_addr: IpAddr,
    /// Rendezvous port
    pub master_port: u16,
    /// Backend identifier
    pub backend: Backend,
    /// Deadline for each join phase
    pub join_timeout: Duration,
}

impl BootstrapEnv {
    /// Create an environment for `rank` on the loopback interface
    #[must_use]
    pub fn new(rank: Rank, topology: Topology, master_port: u16) -> Self {
        Self {
            rank,
            topology,
            master_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            master_port,
            backend: Backend::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Set the backend
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the join deadline
    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the rendezvous host
    #[must_use]
    pub fn with_master_addr(mut self, addr: IpAddr) -> Self {
        self.master_addr = addr;
        self
    }

    /// Rendezvous socket address
    #[must_use]
    pub fn rendezvous_addr(&self) -> SocketAddr {
        SocketAddr::new(self.master_addr, self.master_port)
    }

    /// Whether this environment describes the controller
    #[must_use]
    pub fn is_controller(&self) -> bool {
        self.rank == self.topology.controller()
    }

    /// Environment variables describing this participant as a worker
    #[must_use]
    pub fn to_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ROLE_VAR, WORKER_ROLE.to_string()),
            (MASTER_ADDR_VAR, self.master_addr.to_string()),
            (MASTER_PORT_VAR, self.master_port.to_string()),
            (RANK_VAR, self.rank.to_string()),
            (LOCAL_RANK_VAR, self.rank.to_string()),
            (WORLD_SIZE_VAR, self.topology.world_size().to_string()),
            (BACKEND_VAR, self.backend.to_string()),
            (
                JOIN_TIMEOUT_VAR,
                self.join_timeout.as_millis().to_string(),
            ),
        ]
    }

    /// Read a worker environment from the process environment.
    ///
    /// Returns `Ok(None)` when this process was not spawned as a worker.
    ///
    /// # Errors
    ///
    /// Returns error if the worker role is set but a variable is missing or malformed
    pub fn from_env() -> ClusterResult<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read a worker environment through an arbitrary lookup
    ///
    /// # Errors
    ///
    /// Returns error if the worker role is set but a variable is missing or malformed
    pub fn from_lookup<F>(lookup: F) -> ClusterResult<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(ROLE_VAR) {
            Some(role) if role == WORKER_ROLE => {}
            _ => return Ok(None),
        }

        let require = |key: &str| {
            lookup(key).ok_or_else(|| ClusterError::Config {
                reason: format!("missing environment variable {}", key),
            })
        };

        let master_addr: IpAddr = parse_var(MASTER_ADDR_VAR, &require(MASTER_ADDR_VAR)?)?;
        let master_port: u16 = parse_var(MASTER_PORT_VAR, &require(MASTER_PORT_VAR)?)?;
        let rank: u32 = parse_var(RANK_VAR, &require(RANK_VAR)?)?;
        let world_size: u32 = parse_var(WORLD_SIZE_VAR, &require(WORLD_SIZE_VAR)?)?;
        let topology = Topology::from_world_size(world_size)?;

        let rank = Rank::new(rank);
        if !topology.is_worker(rank) {
            return Err(ClusterError::Config {
                reason: format!("rank {} is not a worker rank for world size {}", rank, world_size),
            });
        }

        let backend = match lookup(BACKEND_VAR) {
            Some(b) => b.parse()?,
            None => Backend::default(),
        };
        let join_timeout = match lookup(JOIN_TIMEOUT_VAR) {
            Some(ms) => Duration::from_millis(parse_var(JOIN_TIMEOUT_VAR, &ms)?),
            None => DEFAULT_JOIN_TIMEOUT,
        };

        Ok(Some(Self {
            rank,
            topology,
            master_addr,
            master_port,
            backend,
            join_timeout,
        }))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> ClusterResult<T> {
    value.trim().parse().map_err(|_| ClusterError::Config {
        reason: format!("malformed {}: {:?}", key, value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: Vec<(&'static str, String)>) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_vars_roundtrip() {
        let topo = Topology::new(3).unwrap();
        let env = BootstrapEnv::new(Rank::new(1), topo, 41000)
            .with_backend(Backend::Process)
            .with_join_timeout(Duration::from_millis(1500));

        let parsed = BootstrapEnv::from_lookup(lookup_from(env.to_vars()))
            .unwrap()
            .unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_world_size_includes_controller() {
        let topo = Topology::new(3).unwrap();
        let env = BootstrapEnv::new(Rank::new(0), topo, 41000);
        let vars: HashMap<_, _> = env.to_vars().into_iter().collect();
        assert_eq!(vars[WORLD_SIZE_VAR], "4");
        assert_eq!(vars[RANK_VAR], vars[LOCAL_RANK_VAR]);
    }

    #[test]
    fn test_not_a_worker() {
        let parsed = BootstrapEnv::from_lookup(|_| None).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_missing_variable() {
        let mut vars = BootstrapEnv::new(Rank::new(0), Topology::new(1).unwrap(), 1).to_vars();
        vars.retain(|(k, _)| *k != MASTER_PORT_VAR);
        let err = BootstrapEnv::from_lookup(lookup_from(vars)).unwrap_err();
        assert!(err.to_string().contains(MASTER_PORT_VAR));
    }

    #[test]
    fn test_controller_rank_rejected_as_worker() {
        let topo = Topology::new(2).unwrap();
        let env = BootstrapEnv::new(topo.controller(), topo, 1);
        assert!(env.is_controller());
        let err = BootstrapEnv::from_lookup(lookup_from(env.to_vars())).unwrap_err();
        assert!(matches!(err, ClusterError::Config { .. }));
    }
}
