//! distdev Core Types
//!
//! Ranks, topology, backend identifiers, the bootstrap environment and the
//! error taxonomy shared by the rest of the workspace.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod env;
pub mod error;
pub mod port;
pub mod rank;

// Re-exports
pub use backend::Backend;
pub use env::{BootstrapEnv, DEFAULT_JOIN_TIMEOUT};
pub use error::{ClusterError, ClusterResult, RemoteError, RemoteErrorKind};
pub use port::free_port;
pub use rank::{CONTROLLER_NAME, Rank, Topology, worker_name};
