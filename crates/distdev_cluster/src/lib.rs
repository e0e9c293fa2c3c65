//! distdev Cluster
//!
//! Spawns N workers on one host, joins them into a process group and a call
//! mesh, then broadcasts callables and cells to every worker and collects
//! the rank-ordered results.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod launcher;
pub mod mesh;
pub mod remote;
pub mod rendezvous;
pub mod shipper;
pub mod singleton;
pub mod task;
pub mod wire;
pub mod worker;

pub use cluster::Cluster;
pub use config::{ClusterConfig, DEFAULT_SHUTDOWN_GRACE};
pub use launcher::{WorkerHandle, live_thread_workers};
pub use mesh::{CallMesh, MeshListener, WorkerConnection};
pub use remote::{CallOptions, RemoteOp, ShippedUnit, UnitSource};
pub use rendezvous::{GroupMembership, PeerInfo, ProcessGroup, Rendezvous};
pub use shipper::{CodeShipper, UnitInstaller};
pub use task::{CallArgs, Callable, FnTask, RegistryError, Task, TaskContext, TaskError, TaskRegistry};
pub use worker::{Worker, WorkerState, run_process, run_thread};

// Shared types callers need alongside the cluster API
pub use distdev_core::{Backend, BootstrapEnv, ClusterError, ClusterResult, Rank, RemoteError, RemoteErrorKind};
pub use tokio_util::sync::CancellationToken;
