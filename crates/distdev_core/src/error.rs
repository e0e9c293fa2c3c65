//! Error taxonomy shared by every distdev crate.

use crate::rank::Rank;
use serde::{Deserialize, Serialize};

/// Cluster result type
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Category of a failure raised on a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Installing a shipped unit failed
    Install,
    /// The submitted work returned an error
    Execution,
    /// The callable was invoked before being installed
    NotInstalled,
    /// The submitted work panicked
    Panicked,
    /// The worker could not make sense of the request
    Protocol,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Install => "install failed",
            Self::Execution => "execution failed",
            Self::NotInstalled => "not installed",
            Self::Panicked => "panicked",
            Self::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

/// Failure reported by a worker across the call boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Failure category
    pub kind: RemoteErrorKind,
    /// Message produced on the worker
    pub message: String,
}

impl RemoteError {
    /// Create a remote error
    #[must_use]
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Cluster error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Invalid configuration or environment
    #[error("Invalid configuration: {reason}")]
    Config {
        /// What was wrong
        reason: String,
    },

    /// No rendezvous port could be obtained
    #[error("Port allocation failed: {reason}")]
    PortAllocation {
        /// Underlying I/O failure
        reason: String,
    },

    /// A worker could not be started
    #[error("Failed to spawn worker {rank}: {reason}")]
    Spawn {
        /// Rank of the worker
        rank: Rank,
        /// Underlying failure
        reason: String,
    },

    /// Joining the process group failed
    #[error("Rendezvous failed: {reason}")]
    Rendezvous {
        /// What went wrong
        reason: String,
    },

    /// Joining the call mesh failed
    #[error("Call mesh join failed for {peer}: {reason}")]
    MeshJoin {
        /// Mesh name of the peer
        peer: String,
        /// What went wrong
        reason: String,
    },

    /// A bootstrap phase did not complete in time
    #[error("Timed out after {timeout_ms}ms waiting for {phase}")]
    JoinTimeout {
        /// Bootstrap phase
        phase: String,
        /// Deadline that expired
        timeout_ms: u64,
    },

    /// A cluster already exists
    #[error("Cluster already initialized")]
    AlreadyInitialized,

    /// No live cluster
    #[error("Cluster is not initialized; call init first")]
    Uninitialized,

    /// Work failed on a worker
    #[error("Worker {rank} failed: {error}")]
    Remote {
        /// Rank of the failing worker
        rank: Rank,
        /// Failure reported by the worker
        error: RemoteError,
    },

    /// The connection to a peer closed while a call was outstanding
    #[error("Connection to rank {rank} closed")]
    ConnectionClosed {
        /// Rank of the peer
        rank: Rank,
    },

    /// Framing or I/O failure on an established connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// A remote call exceeded its deadline
    #[error("Call to rank {rank} timed out after {timeout_ms}ms")]
    Timeout {
        /// Rank of the peer
        rank: Rank,
        /// Deadline that expired
        timeout_ms: u64,
    },

    /// A remote call was cancelled by the caller
    #[error("Call to rank {rank} cancelled")]
    Cancelled {
        /// Rank of the peer
        rank: Rank,
    },

    /// Tearing the cluster down did not complete cleanly
    #[error("Teardown failed: {reason}")]
    Teardown {
        /// What went wrong
        reason: String,
    },
}

impl ClusterError {
    /// Whether this error happened while bringing the cluster up
    #[must_use]
    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            Self::PortAllocation { .. }
                | Self::Spawn { .. }
                | Self::Rendezvous { .. }
                | Self::MeshJoin { .. }
                | Self::JoinTimeout { .. }
        )
    }

    /// The remote failure carried by this error, if any
    #[must_use]
    pub fn remote(&self) -> Option<(Rank, &RemoteError)> {
        match self {
            Self::Remote { rank, error } => Some((*rank, error)),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(format!("invalid payload: {}", err))
    }
}
