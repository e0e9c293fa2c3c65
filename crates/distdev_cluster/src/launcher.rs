//! Starting and reaping workers for each backend.

use crate::config::ClusterConfig;
use crate::task::TaskRegistry;
use crate::worker;
use distdev_core::{Backend, BootstrapEnv, ClusterError, ClusterResult, Rank, Topology, worker_name};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

/// How long an aborted thread worker gets to notice its cancellation
const THREAD_ABORT_GRACE: Duration = Duration::from_secs(1);

static LIVE_THREAD_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Number of thread-backend workers currently running in this process
#[must_use]
pub fn live_thread_workers() -> usize {
    LIVE_THREAD_WORKERS.load(Ordering::SeqCst)
}

struct LiveGuard;

impl LiveGuard {
    fn enter() -> Self {
        LIVE_THREAD_WORKERS.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        LIVE_THREAD_WORKERS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A spawned worker
pub enum WorkerHandle {
    /// Child process
    Process {
        /// Worker rank
        rank: Rank,
        /// Process handle; killed when dropped
        child: Child,
    },
    /// In-process thread with its own runtime
    Thread {
        /// Worker rank
        rank: Rank,
        /// Thread handle
        handle: std::thread::JoinHandle<ClusterResult<()>>,
        /// Stops a worker that is still joining
        cancel: CancellationToken,
    },
}

impl WorkerHandle {
    /// Worker rank
    #[must_use]
    pub fn rank(&self) -> Rank {
        match self {
            Self::Process { rank, .. } | Self::Thread { rank, .. } => *rank,
        }
    }

    /// Wait up to `grace` for the worker to exit. A process still running
    /// afterwards is killed; a thread still running is detached.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Teardown`] if the worker exited with a failure
    /// or had to be forcibly stopped
    pub async fn join(self, grace: Duration) -> ClusterResult<()> {
        match self {
            Self::Process { rank, mut child } => match timeout(grace, child.wait()).await {
                Ok(Ok(status)) if status.success() => Ok(()),
                Ok(Ok(status)) => Err(ClusterError::Teardown {
                    reason: format!("worker {} exited with {}", rank, status),
                }),
                Ok(Err(e)) => Err(ClusterError::Teardown {
                    reason: format!("waiting for worker {} failed: {}", rank, e),
                }),
                Err(_) => {
                    tracing::warn!(%rank, "worker still running after grace period, killing it");
                    child.kill().await?;
                    Err(ClusterError::Teardown {
                        reason: format!("worker {} was killed after {:?}", rank, grace),
                    })
                }
            },
            Self::Thread { rank, handle, .. } => {
                if !wait_finished(&handle, grace).await {
                    tracing::warn!(%rank, "worker thread still running after grace period, detaching it");
                    return Err(ClusterError::Teardown {
                        reason: format!("worker {} did not stop within {:?}", rank, grace),
                    });
                }
                match handle.join() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ClusterError::Teardown {
                        reason: format!("worker {} failed: {}", rank, e),
                    }),
                    Err(_) => Err(ClusterError::Teardown {
                        reason: format!("worker {} panicked", rank),
                    }),
                }
            }
        }
    }

    /// Stop the worker without waiting for it to finish cleanly
    pub async fn abort(self) {
        match self {
            Self::Process { rank, mut child } => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(%rank, error = %e, "kill failed");
                }
            }
            Self::Thread {
                rank,
                handle,
                cancel,
            } => {
                cancel.cancel();
                if !wait_finished(&handle, THREAD_ABORT_GRACE).await {
                    tracing::debug!(%rank, "aborted worker thread still running, detaching it");
                }
            }
        }
    }
}

async fn wait_finished<T>(handle: &std::thread::JoinHandle<T>, grace: Duration) -> bool {
    let expires = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= expires {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Spawn one worker per rank of `topology`.
///
/// On failure every worker spawned so far is killed.
///
/// # Errors
///
/// Returns [`ClusterError::Spawn`] for the first worker that cannot be started
pub async fn spawn_workers(
    config: &ClusterConfig,
    topology: Topology,
    port: u16,
) -> ClusterResult<Vec<WorkerHandle>> {
    let mut workers = Vec::with_capacity(topology.workers() as usize);
    for rank in topology.worker_ranks() {
        let env = BootstrapEnv::new(rank, topology, port)
            .with_backend(config.backend)
            .with_join_timeout(config.join_timeout);
        let spawned = match config.backend {
            Backend::Process => spawn_process(config, env),
            Backend::Thread => spawn_thread(Arc::clone(&config.registry), env),
        };
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                for worker in workers {
                    worker.abort().await;
                }
                return Err(e);
            }
        }
    }
    tracing::debug!(workers = workers.len(), backend = %config.backend, "workers spawned");
    Ok(workers)
}

fn spawn_process(config: &ClusterConfig, env: BootstrapEnv) -> ClusterResult<WorkerHandle> {
    let rank = env.rank;
    let program = config.worker_program()?;
    let child = Command::new(&program)
        .args(&config.program_args)
        .envs(env.to_vars())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ClusterError::Spawn {
            rank,
            reason: format!("{}: {}", program.display(), e),
        })?;
    tracing::debug!(%rank, pid = child.id(), "worker process started");
    Ok(WorkerHandle::Process { rank, child })
}

fn spawn_thread(registry: Arc<TaskRegistry>, env: BootstrapEnv) -> ClusterResult<WorkerHandle> {
    let rank = env.rank;
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let live = LiveGuard::enter();
    let handle = std::thread::Builder::new()
        .name(worker_name(rank))
        .spawn(move || {
            let _live = live;
            worker::run_thread(env, registry, worker_cancel)
        })
        .map_err(|e| ClusterError::Spawn {
            rank,
            reason: e.to_string(),
        })?;
    Ok(WorkerHandle::Thread {
        rank,
        handle,
        cancel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_abort_stops_joining_thread_worker() {
        let topology = Topology::new(1).unwrap();
        let env = BootstrapEnv::new(Rank::new(0), topology, unused_port().await)
            .with_backend(Backend::Thread)
            .with_join_timeout(Duration::from_secs(30));
        let worker = spawn_thread(Arc::new(TaskRegistry::new()), env).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        worker.abort().await;
        assert!(started.elapsed() < THREAD_ABORT_GRACE);
    }

    #[tokio::test]
    async fn test_join_reports_cancelled_thread_worker() {
        let topology = Topology::new(1).unwrap();
        let env = BootstrapEnv::new(Rank::new(0), topology, unused_port().await)
            .with_join_timeout(Duration::from_secs(30));
        let worker = spawn_thread(Arc::new(TaskRegistry::new()), env).unwrap();
        let WorkerHandle::Thread { cancel, .. } = &worker else {
            panic!("expected a thread worker");
        };
        cancel.cancel();

        let err = worker.join(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Teardown { reason } if reason.contains("cancelled")));
    }
}
