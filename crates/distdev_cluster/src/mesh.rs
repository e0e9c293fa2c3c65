//! Point-to-point call mesh between the controller and each worker.
//!
//! The controller holds one connection per worker, served by a reader task
//! and a writer task. Requests carry a per-connection id; the reader routes
//! each response to the waiting caller and forwards worker log records into
//! the shared log channel. A worker writes every log record it has queued
//! before each response, so a call's logs are in the channel by the time
//! its result is delivered.

use crate::remote::{CallOptions, RemoteOp, RemoteRequest, RemoteResponse, ShippedUnit};
use crate::rendezvous::PeerInfo;
use crate::shipper::UnitInstaller;
use crate::wire::{self, FrameReader, FrameWriter};
use async_trait::async_trait;
use distdev_core::{
    CONTROLLER_NAME, ClusterError, ClusterResult, Rank, Topology, worker_name,
};
use distdev_log::{LogReceiver, LogRecord, LogSender};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Messages on a mesh connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshMessage {
    /// Controller introduces itself
    Hello {
        /// Sender name
        name: String,
        /// Sender rank
        rank: Rank,
    },
    /// Worker answers the introduction
    HelloAck {
        /// Sender name
        name: String,
        /// Sender rank
        rank: Rank,
    },
    /// Controller to worker
    Request(RemoteRequest),
    /// Worker to controller
    Response(RemoteResponse),
    /// Worker log output
    Log(LogRecord),
    /// Controller asks the worker to stop serving
    Shutdown,
    /// Worker confirms it stopped serving
    ShutdownAck,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<RemoteResponse>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct PeerLink {
    rank: Rank,
    outbound: mpsc::UnboundedSender<MeshMessage>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, id: u64) {
        self.pending().waiters.remove(&id);
    }
}

/// Controller side of the call mesh
pub struct CallMesh {
    topology: Topology,
    links: Vec<PeerLink>,
}

impl CallMesh {
    /// Connect to every worker in rank order and complete the hello handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::MeshJoin`] for the first worker that cannot be
    /// reached or answers incorrectly, and [`ClusterError::JoinTimeout`] if a
    /// handshake exceeds `deadline`
    pub async fn connect(
        topology: Topology,
        peers: &[PeerInfo],
        logs: LogSender,
        deadline: Duration,
    ) -> ClusterResult<Self> {
        let mut links = Vec::with_capacity(peers.len());
        for peer in peers {
            let handshake = timeout(deadline, handshake(topology, peer))
                .await
                .map_err(|_| ClusterError::JoinTimeout {
                    phase: format!("call mesh handshake with {}", peer.name),
                    timeout_ms: millis(deadline),
                })??;
            links.push(spawn_link(peer.rank, handshake, logs.clone()));
        }
        tracing::info!(workers = links.len(), "call mesh connected");
        Ok(Self { topology, links })
    }

    /// Cluster shape
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    fn link(&self, rank: Rank) -> ClusterResult<&PeerLink> {
        self.links
            .get(rank.index())
            .ok_or_else(|| ClusterError::Transport(format!("no mesh connection to rank {}", rank)))
    }

    /// Issue one call and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Remote`] when the worker reports a failure,
    /// [`ClusterError::Timeout`] or [`ClusterError::Cancelled`] per `options`,
    /// and [`ClusterError::ConnectionClosed`] if the worker goes away
    pub async fn call(
        &self,
        rank: Rank,
        op: RemoteOp,
        options: &CallOptions,
    ) -> ClusterResult<Option<Value>> {
        let link = self.link(rank)?;
        let id = link.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = link.pending();
            if pending.closed {
                return Err(ClusterError::ConnectionClosed { rank });
            }
            pending.waiters.insert(id, tx);
        }

        tracing::trace!(%rank, id, op = op.kind(), "sending request");
        if link
            .outbound
            .send(MeshMessage::Request(RemoteRequest { id, op }))
            .is_err()
        {
            link.forget(id);
            return Err(ClusterError::ConnectionClosed { rank });
        }

        let expiry = async {
            match options.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let response = tokio::select! {
            response = rx => response.map_err(|_| ClusterError::ConnectionClosed { rank })?,
            () = expiry => {
                link.forget(id);
                return Err(ClusterError::Timeout {
                    rank,
                    timeout_ms: options.timeout.map(millis).unwrap_or(0),
                });
            }
            () = cancelled => {
                link.forget(id);
                return Err(ClusterError::Cancelled { rank });
            }
        };

        response
            .outcome
            .map_err(|error| ClusterError::Remote { rank, error })
    }

    /// Send `op` to every worker concurrently and wait for all of them.
    ///
    /// Results are in rank order. If any call failed, the failure of the
    /// lowest failing rank is returned once every call has finished.
    ///
    /// # Errors
    ///
    /// Returns the lowest failing rank's error
    pub async fn broadcast(
        &self,
        op: &RemoteOp,
        options: &CallOptions,
    ) -> ClusterResult<Vec<Option<Value>>> {
        let calls = self
            .links
            .iter()
            .map(|link| self.call(link.rank, op.clone(), options));
        join_all(calls).await.into_iter().collect()
    }

    /// Ask every worker to stop serving and wait up to `grace` for each
    /// acknowledgement. Returns the ranks that did not acknowledge.
    pub async fn shutdown(self, grace: Duration) -> Vec<Rank> {
        let acks = self.links.iter().map(|link| async move {
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = link.pending();
                if pending.closed {
                    return Some(link.rank);
                }
                pending.shutdown = Some(tx);
            }
            if link.outbound.send(MeshMessage::Shutdown).is_err() {
                return Some(link.rank);
            }
            match timeout(grace, rx).await {
                Ok(Ok(())) => None,
                _ => Some(link.rank),
            }
        });
        let missing: Vec<Rank> = join_all(acks).await.into_iter().flatten().collect();

        for link in self.links {
            drop(link.outbound);
            if timeout(grace, link.writer).await.is_err() {
                tracing::debug!(rank = %link.rank, "mesh writer did not finish");
            }
            let mut reader = link.reader;
            if timeout(grace, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        if !missing.is_empty() {
            tracing::warn!(?missing, "workers did not acknowledge shutdown");
        }
        missing
    }
}

#[async_trait]
impl UnitInstaller for CallMesh {
    fn workers(&self) -> usize {
        self.links.len()
    }

    async fn install(&self, unit: &ShippedUnit, options: &CallOptions) -> ClusterResult<()> {
        self.broadcast(&RemoteOp::Install(unit.clone()), options)
            .await
            .map(|_| ())
    }
}

async fn handshake(topology: Topology, peer: &PeerInfo) -> ClusterResult<(FrameReader, FrameWriter)> {
    let join_err = |reason: String| ClusterError::MeshJoin {
        peer: peer.name.clone(),
        reason,
    };

    let stream = TcpStream::connect(peer.mesh_addr)
        .await
        .map_err(|e| join_err(format!("connect to {} failed: {}", peer.mesh_addr, e)))?;
    let (mut reader, mut writer) = wire::split(stream)?;

    let hello = MeshMessage::Hello {
        name: CONTROLLER_NAME.to_string(),
        rank: topology.controller(),
    };
    wire::send(&mut writer, &hello)
        .await
        .map_err(|e| join_err(e.to_string()))?;

    match wire::recv(&mut reader).await.map_err(|e| join_err(e.to_string()))? {
        Some(MeshMessage::HelloAck { name, rank }) if rank == peer.rank && name == worker_name(rank) => {
            Ok((reader, writer))
        }
        Some(MeshMessage::HelloAck { name, rank }) => Err(join_err(format!(
            "expected {} but {} (rank {}) answered",
            peer.name, name, rank
        ))),
        Some(other) => Err(join_err(format!("unexpected handshake reply {:?}", other))),
        None => Err(join_err("connection closed during handshake".to_string())),
    }
}

fn spawn_link(rank: Rank, (reader, writer): (FrameReader, FrameWriter), logs: LogSender) -> PeerLink {
    let (outbound, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(Mutex::new(Pending::default()));

    PeerLink {
        rank,
        outbound,
        next_id: AtomicU64::new(0),
        reader: tokio::spawn(read_loop(rank, reader, Arc::clone(&pending), logs)),
        writer: tokio::spawn(write_loop(rank, writer, rx)),
        pending,
    }
}

async fn write_loop(
    rank: Rank,
    mut writer: FrameWriter,
    mut rx: mpsc::UnboundedReceiver<MeshMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = wire::send(&mut writer, &message).await {
            tracing::debug!(%rank, error = %e, "mesh write failed");
            break;
        }
    }
}

async fn read_loop(
    rank: Rank,
    mut reader: FrameReader,
    pending: Arc<Mutex<Pending>>,
    logs: LogSender,
) {
    loop {
        let message = match wire::recv::<_, MeshMessage>(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%rank, error = %e, "mesh read failed");
                break;
            }
        };

        match message {
            MeshMessage::Log(record) => {
                let _ = logs.send(record);
            }
            MeshMessage::Response(response) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .waiters
                    .remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!(%rank, id = response.id, "discarding late response"),
                }
            }
            MeshMessage::ShutdownAck => {
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).shutdown.take();
                if let Some(tx) = waiter {
                    let _ = tx.send(());
                }
            }
            other => tracing::warn!(%rank, ?other, "unexpected message from worker"),
        }
    }

    // Waiters see their senders dropped and fail with ConnectionClosed.
    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
    pending.closed = true;
    pending.waiters.clear();
    pending.shutdown = None;
}

/// Worker's mesh listener, bound before it joins the process group
pub struct MeshListener {
    listener: TcpListener,
}

impl MeshListener {
    /// Bind an ephemeral loopback port
    ///
    /// # Errors
    ///
    /// Returns error if no port can be bound
    pub async fn bind() -> ClusterResult<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
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

    /// Accept the controller's connection and answer its hello
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::JoinTimeout`] past `deadline` and
    /// [`ClusterError::MeshJoin`] if the peer is not the controller
    pub async fn accept(
        self,
        rank: Rank,
        topology: Topology,
        logs: LogReceiver,
        deadline: Duration,
    ) -> ClusterResult<WorkerConnection> {
        let join_err = |reason: String| ClusterError::MeshJoin {
            peer: CONTROLLER_NAME.to_string(),
            reason,
        };

        let accept = async {
            let (stream, _) = self.listener.accept().await?;
            let (mut reader, mut writer) = wire::split(stream)?;
            match wire::recv(&mut reader).await? {
                Some(MeshMessage::Hello { name, rank: from })
                    if name == CONTROLLER_NAME && from == topology.controller() => {}
                Some(other) => return Err(join_err(format!("unexpected hello {:?}", other))),
                None => return Err(join_err("connection closed during handshake".to_string())),
            }
            let ack = MeshMessage::HelloAck {
                name: worker_name(rank),
                rank,
            };
            wire::send(&mut writer, &ack).await?;
            Ok::<_, ClusterError>((reader, writer))
        };

        let (reader, writer) = timeout(deadline, accept)
            .await
            .map_err(|_| ClusterError::JoinTimeout {
                phase: "call mesh handshake".to_string(),
                timeout_ms: millis(deadline),
            })??;

        Ok(WorkerConnection {
            reader,
            writer,
            logs,
        })
    }
}

/// What the controller asked a worker to do next
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A call to serve
    Request(RemoteRequest),
    /// Stop serving
    Shutdown,
    /// A request whose operation did not decode; answer it with a protocol error
    Malformed {
        /// Id of the request
        id: u64,
        /// Decode failure
        reason: String,
    },
}

/// Enough of a request frame to answer it when the operation does not decode
#[derive(Deserialize)]
enum RequestHeader {
    Request { id: u64 },
}

fn classify(frame: &[u8]) -> ClusterResult<Inbound> {
    match wire::decode::<MeshMessage>(frame) {
        Ok(MeshMessage::Request(request)) => Ok(Inbound::Request(request)),
        Ok(MeshMessage::Shutdown) => Ok(Inbound::Shutdown),
        Ok(other) => Err(ClusterError::Transport(format!(
            "unexpected message from controller: {:?}",
            other
        ))),
        Err(e) => match wire::decode::<RequestHeader>(frame) {
            Ok(RequestHeader::Request { id }) => Ok(Inbound::Malformed {
                id,
                reason: e.to_string(),
            }),
            Err(_) => Err(e),
        },
    }
}

/// Worker side of its mesh connection to the controller
pub struct WorkerConnection {
    reader: FrameReader,
    writer: FrameWriter,
    logs: LogReceiver,
}

impl WorkerConnection {
    /// Wait for the next request, forwarding log records while idle.
    ///
    /// Returns `None` when the controller closed the connection.
    ///
    /// # Errors
    ///
    /// Returns error on a transport failure
    pub async fn next(&mut self) -> ClusterResult<Option<Inbound>> {
        loop {
            tokio::select! {
                biased;
                frame = wire::recv_frame(&mut self.reader) => {
                    return match frame? {
                        Some(frame) => classify(&frame).map(Some),
                        None => Ok(None),
                    };
                }
                Some(record) = self.logs.recv() => {
                    wire::send(&mut self.writer, &MeshMessage::Log(record)).await?;
                }
            }
        }
    }

    async fn flush_logs(&mut self) -> ClusterResult<()> {
        while let Ok(record) = self.logs.try_recv() {
            wire::send(&mut self.writer, &MeshMessage::Log(record)).await?;
        }
        Ok(())
    }

    /// Write every queued log record, then the response
    ///
    /// # Errors
    ///
    /// Returns error on a transport failure
    pub async fn respond(&mut self, response: RemoteResponse) -> ClusterResult<()> {
        self.flush_logs().await?;
        wire::send(&mut self.writer, &MeshMessage::Response(response)).await
    }

    /// Write queued logs and acknowledge shutdown, then close the connection
    ///
    /// # Errors
    ///
    /// Returns error on a transport failure
    pub async fn acknowledge_shutdown(mut self) -> ClusterResult<()> {
        self.flush_logs().await?;
        wire::send(&mut self.writer, &MeshMessage::ShutdownAck).await
    }
}
