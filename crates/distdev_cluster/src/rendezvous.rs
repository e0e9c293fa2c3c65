//! Process group formation at the controller's rendezvous address.
//!
//! The controller binds the rendezvous port and waits for one `Join` per
//! worker rank. Once every rank has joined, each worker receives the full
//! peer list. The connections stay open for the group's lifetime and carry
//! the leave/destroy handshake at teardown.

use crate::wire::{self, FrameReader, FrameWriter};
use distdev_core::{BootstrapEnv, ClusterError, ClusterResult, Rank, Topology, worker_name};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, timeout, timeout_at};

/// Interval between connection attempts while the controller is not yet listening
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// How long either side waits for the other's half of the teardown handshake
pub const LEAVE_GRACE: Duration = Duration::from_secs(5);

/// One member of the group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Rank
    pub rank: Rank,
    /// Mesh name
    pub name: String,
    /// Address of the member's call mesh listener
    pub mesh_addr: SocketAddr,
}

/// Messages on a rendezvous connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Worker asks to join
    Join {
        /// Claimed rank
        rank: Rank,
        /// World size the worker was started with
        world_size: u32,
        /// Mesh name
        name: String,
        /// Mesh listener address
        mesh_addr: SocketAddr,
    },
    /// Every rank has joined
    Welcome {
        /// All workers, in rank order
        peers: Vec<PeerInfo>,
    },
    /// Join refused
    Reject {
        /// Why
        reason: String,
    },
    /// Worker is leaving
    Leave,
    /// Controller is destroying the group
    Destroy,
}

/// Controller's bound rendezvous socket, not yet accepting
pub struct Rendezvous {
    listener: TcpListener,
}

impl Rendezvous {
    /// Bind the rendezvous port on the loopback interface
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Rendezvous`] if the port cannot be bound
    pub async fn bind(port: u16) -> ClusterResult<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).await.map_err(|e| ClusterError::Rendezvous {
            reason: format!("cannot bind {}: {}", addr, e),
        })?;
        tracing::debug!(%addr, "rendezvous listening");
        Ok(Self { listener })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address
    pub fn local_addr(&self) -> ClusterResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept joins until every worker rank of `topology` is present.
    ///
    /// Joins with a wrong world size, an out-of-range rank or a rank that
    /// already joined are rejected and do not count.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::JoinTimeout`] if the group is incomplete at the deadline
    pub async fn form(self, topology: Topology, deadline: Duration) -> ClusterResult<ProcessGroup> {
        let timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        let expires = Instant::now() + deadline;
        let mut joined: BTreeMap<Rank, Member> = BTreeMap::new();

        while joined.len() < topology.workers() as usize {
            let accepted = timeout_at(expires, self.listener.accept())
                .await
                .map_err(|_| ClusterError::JoinTimeout {
                    phase: format!(
                        "rendezvous ({} of {} workers joined)",
                        joined.len(),
                        topology.workers()
                    ),
                    timeout_ms,
                })?;
            let (stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "rendezvous accept failed");
                    continue;
                }
            };

            let (mut reader, mut writer) = wire::split(stream)?;
            let first = timeout_at(expires, wire::recv::<_, GroupMessage>(&mut reader)).await;
            let message = match first {
                Err(_) => continue,
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(%remote, error = %e, "malformed join");
                    continue;
                }
            };

            match validate(&message, topology, &joined) {
                Ok(peer) => {
                    tracing::debug!(rank = %peer.rank, mesh_addr = %peer.mesh_addr, "worker joined");
                    joined.insert(
                        peer.rank,
                        Member {
                            peer,
                            reader,
                            writer,
                        },
                    );
                }
                Err(reason) => {
                    tracing::warn!(%remote, %reason, "join rejected");
                    let _ = wire::send(&mut writer, &GroupMessage::Reject { reason }).await;
                }
            }
        }

        let peers: Vec<PeerInfo> = joined.values().map(|m| m.peer.clone()).collect();
        let mut members: Vec<Member> = joined.into_values().collect();
        for member in &mut members {
            let welcome = GroupMessage::Welcome {
                peers: peers.clone(),
            };
            wire::send(&mut member.writer, &welcome)
                .await
                .map_err(|e| ClusterError::Rendezvous {
                    reason: format!("welcome to rank {} failed: {}", member.peer.rank, e),
                })?;
        }

        tracing::info!(workers = peers.len(), "process group formed");
        Ok(ProcessGroup { topology, members })
    }
}

fn validate(
    message: &GroupMessage,
    topology: Topology,
    joined: &BTreeMap<Rank, Member>,
) -> Result<PeerInfo, String> {
    let GroupMessage::Join {
        rank,
        world_size,
        name,
        mesh_addr,
    } = message
    else {
        return Err("expected a join request".to_string());
    };
    if *world_size != topology.world_size() {
        return Err(format!(
            "world size {} does not match {}",
            world_size,
            topology.world_size()
        ));
    }
    if !topology.is_worker(*rank) {
        return Err(format!(
            "rank {} is outside 0..{}",
            rank,
            topology.workers()
        ));
    }
    if joined.contains_key(rank) {
        return Err(format!("rank {} already joined", rank));
    }
    Ok(PeerInfo {
        rank: *rank,
        name: name.clone(),
        mesh_addr: *mesh_addr,
    })
}

struct Member {
    peer: PeerInfo,
    reader: FrameReader,
    writer: FrameWriter,
}

/// Controller's view of a formed group
pub struct ProcessGroup {
    topology: Topology,
    members: Vec<Member>,
}

impl ProcessGroup {
    /// Group shape
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Members in rank order
    #[must_use]
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.members.iter().map(|m| m.peer.clone()).collect()
    }

    /// Tell every member the group is gone and wait for their `Leave`
    /// (or disconnect), bounded by [`LEAVE_GRACE`].
    pub async fn destroy(self) {
        let farewells = self.members.into_iter().map(|mut member| async move {
            let _ = wire::send(&mut member.writer, &GroupMessage::Destroy).await;
            let left = timeout(LEAVE_GRACE, async {
                loop {
                    match wire::recv::<_, GroupMessage>(&mut member.reader).await {
                        Ok(Some(GroupMessage::Leave)) | Ok(None) | Err(_) => break,
                        Ok(Some(_)) => continue,
                    }
                }
            })
            .await;
            if left.is_err() {
                tracing::warn!(rank = %member.peer.rank, "worker did not leave the group in time");
            }
        });
        join_all(farewells).await;
        tracing::debug!("process group destroyed");
    }
}

/// Worker's membership in a formed group
pub struct GroupMembership {
    peers: Vec<PeerInfo>,
    reader: FrameReader,
    writer: FrameWriter,
}

impl GroupMembership {
    /// Join the group advertised by `env`, announcing `mesh_addr`.
    ///
    /// Connection attempts are retried until the join deadline; anything
    /// after the connection is established is not retried.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::JoinTimeout`] past the deadline and
    /// [`ClusterError::Rendezvous`] if the controller rejects the join
    pub async fn join(env: &BootstrapEnv, mesh_addr: SocketAddr) -> ClusterResult<Self> {
        let timeout_ms = u64::try_from(env.join_timeout.as_millis()).unwrap_or(u64::MAX);
        let expires = Instant::now() + env.join_timeout;
        let addr = env.rendezvous_addr();
        let expired = |phase: &str| ClusterError::JoinTimeout {
            phase: phase.to_string(),
            timeout_ms,
        };

        let stream = loop {
            match timeout_at(expires, TcpStream::connect(addr)).await {
                Err(_) => return Err(expired("rendezvous connect")),
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => {
                    tracing::trace!(%addr, error = %e, "rendezvous not reachable yet");
                    if Instant::now() + CONNECT_RETRY_INTERVAL >= expires {
                        return Err(expired("rendezvous connect"));
                    }
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        };

        let (mut reader, mut writer) = wire::split(stream)?;
        let join = GroupMessage::Join {
            rank: env.rank,
            world_size: env.topology.world_size(),
            name: worker_name(env.rank),
            mesh_addr,
        };
        wire::send(&mut writer, &join).await?;

        let reply = timeout_at(expires, wire::recv::<_, GroupMessage>(&mut reader))
            .await
            .map_err(|_| expired("process group welcome"))??;
        match reply {
            Some(GroupMessage::Welcome { peers }) => Ok(Self {
                peers,
                reader,
                writer,
            }),
            Some(GroupMessage::Reject { reason }) => Err(ClusterError::Rendezvous { reason }),
            Some(other) => Err(ClusterError::Rendezvous {
                reason: format!("unexpected reply {:?}", other),
            }),
            None => Err(ClusterError::Rendezvous {
                reason: "controller closed the rendezvous connection".to_string(),
            }),
        }
    }

    /// All workers in rank order
    #[must_use]
    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    /// Leave the group and wait for the controller's `Destroy` (or disconnect)
    pub async fn leave(mut self) {
        let _ = wire::send(&mut self.writer, &GroupMessage::Leave).await;
        let _ = timeout(LEAVE_GRACE, async {
            loop {
                match wire::recv::<_, GroupMessage>(&mut self.reader).await {
                    Ok(Some(GroupMessage::Destroy)) | Ok(None) | Err(_) => break,
                    Ok(Some(_)) => continue,
                }
            }
        })
        .await;
    }
}
