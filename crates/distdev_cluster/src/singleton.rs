//! Process-wide cluster slot.
//!
//! A thin convenience over [`Cluster`]: nothing else in this crate reads it.

use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::task::TaskRegistry;
use distdev_core::{Backend, ClusterError, ClusterResult};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Mutex;

static CURRENT: Lazy<Mutex<Option<Arc<Cluster>>>> = Lazy::new(|| Mutex::new(None));

/// Start a cluster and hold it in the process-wide slot.
///
/// # Errors
///
/// Returns [`ClusterError::AlreadyInitialized`] without spawning anything if
/// a cluster is already held, and otherwise any bootstrap error
pub async fn init(config: ClusterConfig) -> ClusterResult<Arc<Cluster>> {
    let mut slot = CURRENT.lock().await;
    if slot.is_some() {
        return Err(ClusterError::AlreadyInitialized);
    }
    let cluster = Arc::new(Cluster::initialize(config).await?);
    *slot = Some(Arc::clone(&cluster));
    Ok(cluster)
}

/// [`init`] with `nprocs` workers on `backend`
///
/// # Errors
///
/// Same as [`init`]
pub async fn init_dist(
    backend: Backend,
    nprocs: u32,
    registry: Arc<TaskRegistry>,
) -> ClusterResult<Arc<Cluster>> {
    init(
        ClusterConfig::new(nprocs)
            .with_backend(backend)
            .with_registry(registry),
    )
    .await
}

/// The held cluster, if any
pub async fn get() -> Option<Arc<Cluster>> {
    CURRENT.lock().await.clone()
}

/// The held cluster
///
/// # Errors
///
/// Returns [`ClusterError::Uninitialized`] if the slot is empty
pub async fn require() -> ClusterResult<Arc<Cluster>> {
    get().await.ok_or(ClusterError::Uninitialized)
}

/// Close the held cluster and empty the slot. Does nothing when empty.
///
/// # Errors
///
/// Returns the close error; the slot is emptied regardless
pub async fn destroy() -> ClusterResult<()> {
    let cluster = CURRENT.lock().await.take();
    match cluster {
        Some(cluster) => cluster.close().await,
        None => Ok(()),
    }
}
