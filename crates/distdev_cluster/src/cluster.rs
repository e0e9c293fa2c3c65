//! Controller-side cluster manager.

use crate::config::ClusterConfig;
use crate::launcher::{WorkerHandle, spawn_workers};
use crate::mesh::CallMesh;
use crate::remote::{CallOptions, RemoteOp};
use crate::rendezvous::{ProcessGroup, Rendezvous};
use crate::shipper::CodeShipper;
use crate::task::{CallArgs, Callable, TaskRegistry};
use distdev_core::{Backend, ClusterError, ClusterResult, Rank, Topology, free_port};
use distdev_log::{LogAggregator, log_channel};
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

struct Active {
    mesh: CallMesh,
    group: ProcessGroup,
    workers: Vec<WorkerHandle>,
}

enum ClusterState {
    Active(Box<Active>),
    Closed,
}

/// A running cluster of N workers driven by this process
pub struct Cluster {
    topology: Topology,
    port: u16,
    backend: Backend,
    registry: Arc<TaskRegistry>,
    shutdown_grace: Duration,
    logs: LogAggregator,
    shipper: CodeShipper,
    active: AtomicBool,
    state: RwLock<ClusterState>,
}

impl Cluster {
    /// Spawn the workers and wait until every one has joined the process
    /// group and the call mesh.
    ///
    /// # Errors
    ///
    /// Returns the first bootstrap error; workers spawned so far are stopped
    pub async fn initialize(config: ClusterConfig) -> ClusterResult<Self> {
        let topology = config.validate()?;
        let port = free_port()?;
        let rendezvous = Rendezvous::bind(port).await?;
        let (log_tx, log_rx) = log_channel();

        tracing::info!(
            workers = topology.workers(),
            port,
            backend = %config.backend,
            "initializing cluster"
        );
        let workers = spawn_workers(&config, topology, port).await?;

        let joined = async {
            let group = rendezvous.form(topology, config.join_timeout).await?;
            let mesh = CallMesh::connect(topology, &group.peers(), log_tx, config.join_timeout).await?;
            Ok::<_, ClusterError>((group, mesh))
        }
        .await;

        let (group, mesh) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                tracing::error!(error = %e, "cluster bootstrap failed");
                for worker in workers {
                    worker.abort().await;
                }
                return Err(e);
            }
        };

        tracing::info!(world_size = topology.world_size(), "cluster active");
        Ok(Self {
            topology,
            port,
            backend: config.backend,
            registry: config.registry,
            shutdown_grace: config.shutdown_grace,
            logs: LogAggregator::new(log_rx, config.log_sink),
            shipper: CodeShipper::new(),
            active: AtomicBool::new(true),
            state: RwLock::new(ClusterState::Active(Box::new(Active {
                mesh,
                group,
                workers,
            }))),
        })
    }

    /// Run `callable` on every worker. See [`Cluster::launch_with`].
    ///
    /// # Errors
    ///
    /// Returns the lowest failing rank's error
    pub async fn launch(&self, callable: &Callable, args: CallArgs) -> ClusterResult<Vec<Value>> {
        self.launch_with(callable, args, &CallOptions::default()).await
    }

    /// Ship `callable` if needed, invoke it on every worker concurrently and
    /// return the results in rank order.
    ///
    /// Worker logs are printed while the calls are in flight. All calls are
    /// awaited even when some fail.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Uninitialized`] after [`Cluster::close`] and
    /// otherwise the lowest failing rank's error
    pub async fn launch_with(
        &self,
        callable: &Callable,
        args: CallArgs,
        options: &CallOptions,
    ) -> ClusterResult<Vec<Value>> {
        let state = self.state.read().await;
        let ClusterState::Active(active) = &*state else {
            return Err(ClusterError::Uninitialized);
        };

        let window = self.logs.open();
        let results = async {
            self.shipper.ship(callable, &active.mesh, options).await?;
            let invoke = RemoteOp::Invoke {
                id: callable.id(),
                name: callable.name().to_string(),
                args,
            };
            active.mesh.broadcast(&invoke, options).await
        }
        .await;
        window.close().await;

        let results = results?;
        Ok(results
            .into_iter()
            .map(|value| value.unwrap_or(Value::Null))
            .collect())
    }

    /// Run a cell on every worker. See [`Cluster::launch_cell_with`].
    ///
    /// # Errors
    ///
    /// Returns the lowest failing rank's error
    pub async fn launch_cell(&self, source: &str) -> ClusterResult<Vec<Option<Value>>> {
        self.launch_cell_with(source, &CallOptions::default()).await
    }

    /// Send `source` to every worker and run it in the worker's persistent
    /// namespace. Each result is the value of the cell's final bare
    /// expression, or `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Uninitialized`] after [`Cluster::close`] and
    /// otherwise the lowest failing rank's error
    pub async fn launch_cell_with(
        &self,
        source: &str,
        options: &CallOptions,
    ) -> ClusterResult<Vec<Option<Value>>> {
        let state = self.state.read().await;
        let ClusterState::Active(active) = &*state else {
            return Err(ClusterError::Uninitialized);
        };

        let window = self.logs.open();
        let op = RemoteOp::ExecCell {
            source: source.to_string(),
        };
        let results = active.mesh.broadcast(&op, options).await;
        window.close().await;
        results
    }

    /// Shut the cluster down.
    ///
    /// Workers are asked to stop and given the shutdown grace period to
    /// acknowledge and exit; process workers still running after that are
    /// killed. Closing an already closed cluster does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Teardown`] if any worker failed to stop
    /// cleanly. The cluster is closed either way.
    pub async fn close(&self) -> ClusterResult<()> {
        let mut state = self.state.write().await;
        let ClusterState::Active(active) = std::mem::replace(&mut *state, ClusterState::Closed) else {
            return Ok(());
        };
        self.active.store(false, Ordering::SeqCst);
        let Active {
            mesh,
            group,
            workers,
        } = *active;

        tracing::info!("shutting down cluster");
        let window = self.logs.open();
        let unacknowledged = mesh.shutdown(self.shutdown_grace).await;
        group.destroy().await;

        let grace = self.shutdown_grace;
        let outcomes = join_all(workers.into_iter().map(|worker| worker.join(grace))).await;
        window.close().await;

        let mut reasons: Vec<String> = outcomes
            .into_iter()
            .filter_map(Result::err)
            .map(|e| match e {
                ClusterError::Teardown { reason } => reason,
                other => other.to_string(),
            })
            .collect();
        if !unacknowledged.is_empty() {
            let ranks: Vec<String> = unacknowledged.iter().map(ToString::to_string).collect();
            reasons.insert(0, format!("no shutdown acknowledgement from {}", ranks.join(", ")));
        }

        if reasons.is_empty() {
            tracing::info!("cluster closed");
            Ok(())
        } else {
            tracing::warn!(failures = reasons.len(), "cluster closed with errors");
            Err(ClusterError::Teardown {
                reason: reasons.join("; "),
            })
        }
    }

    /// Number of workers
    #[must_use]
    pub fn workers(&self) -> u32 {
        self.topology.workers()
    }

    /// Workers plus the controller
    #[must_use]
    pub fn world_size(&self) -> u32 {
        self.topology.world_size()
    }

    /// Rendezvous port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Launch backend
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The controller's rank
    #[must_use]
    pub fn controller_rank(&self) -> Rank {
        self.topology.controller()
    }

    /// Tasks this cluster's workers were started with
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Install calls issued by the code shipper so far
    #[must_use]
    pub fn installs_sent(&self) -> usize {
        self.shipper.installs_sent()
    }

    /// Whether [`Cluster::close`] has not been called yet
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("topology", &self.topology)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskError;
    use distdev_core::RemoteErrorKind;
    use distdev_log::MemorySink;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("rank", |ctx, _| Ok(json!(ctx.rank.as_u32())))
            .unwrap();
        registry
            .register_fn("fail_on", |ctx, args| {
                let target = args.int(0)?;
                if i64::from(ctx.rank.as_u32()) == target {
                    Err(TaskError::Failed(format!("rank {} refuses", target)))
                } else {
                    Ok(json!("ok"))
                }
            })
            .unwrap();
        registry
            .register_fn("greet", |ctx, _| {
                tracing::info!("hello from {}", ctx.rank);
                Ok(Value::Null)
            })
            .unwrap();
        registry
            .register_fn("sleep_ms", |_, args| {
                let ms = args.int(0)?;
                std::thread::sleep(Duration::from_millis(ms.unsigned_abs()));
                Ok(json!(ms))
            })
            .unwrap();
        registry
            .register_fn("panic_on", |ctx, args| {
                if i64::from(ctx.rank.as_u32()) == args.int(0)? {
                    panic!("rank {} exploded", ctx.rank);
                }
                Ok(Value::Null)
            })
            .unwrap();
        Arc::new(registry)
    }

    fn config(nprocs: u32) -> ClusterConfig {
        ClusterConfig::new(nprocs)
            .with_backend(Backend::Thread)
            .with_registry(registry())
            .with_join_timeout(Duration::from_secs(10))
            .with_shutdown_grace(Duration::from_secs(5))
            .with_log_sink(Arc::new(MemorySink::new()))
    }

    async fn cluster(nprocs: u32) -> Cluster {
        Cluster::initialize(config(nprocs)).await.unwrap()
    }

    #[tokio::test]
    async fn test_accessors() {
        let cluster = cluster(2).await;
        assert_eq!(cluster.workers(), 2);
        assert_eq!(cluster.world_size(), 3);
        assert_eq!(cluster.controller_rank(), Rank::new(2));
        assert_eq!(cluster.backend(), Backend::Thread);
        assert!(cluster.registry().contains("rank"));
        assert_ne!(cluster.port(), 0);
        assert!(cluster.is_active());
        cluster.close().await.unwrap();
        assert!(!cluster.is_active());
    }

    #[tokio::test]
    async fn test_launch_returns_rank_ordered_results() {
        let cluster = cluster(4).await;
        let rank = cluster.registry().callable("rank").unwrap();
        let results = cluster.launch(&rank, CallArgs::new()).await.unwrap();
        assert_eq!(results, vec![json!(0), json!(1), json!(2), json!(3)]);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_callable_is_shipped_once() {
        let cluster = cluster(3).await;
        let rank = cluster.registry().callable("rank").unwrap();
        for _ in 0..3 {
            cluster.launch(&rank, CallArgs::new()).await.unwrap();
        }
        assert_eq!(cluster.installs_sent(), 3);

        let script = Callable::script("double", "args[0] * 2");
        let results = cluster
            .launch(&script, CallArgs::new().with_arg(21))
            .await
            .unwrap();
        assert_eq!(results, vec![json!(42); 3]);
        assert_eq!(cluster.installs_sent(), 6);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_name_callables_run_their_own_body() {
        let cluster = cluster(2).await;
        let first = Callable::script("f", "1");
        let second = Callable::script("f", "2");

        assert_eq!(cluster.launch(&first, CallArgs::new()).await.unwrap(), vec![json!(1); 2]);
        assert_eq!(cluster.launch(&second, CallArgs::new()).await.unwrap(), vec![json!(2); 2]);
        assert_eq!(cluster.launch(&first, CallArgs::new()).await.unwrap(), vec![json!(1); 2]);
        assert_eq!(cluster.installs_sent(), 4);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_cell() {
        let cluster = cluster(2).await;
        assert_eq!(
            cluster.launch_cell("1 + 1").await.unwrap(),
            vec![Some(json!(2)), Some(json!(2))]
        );
        assert_eq!(cluster.launch_cell("x = 1").await.unwrap(), vec![None, None]);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cell_variables_persist() {
        let cluster = cluster(2).await;
        cluster.launch_cell("total = rank * 10").await.unwrap();
        assert_eq!(
            cluster.launch_cell("total + 1").await.unwrap(),
            vec![Some(json!(1)), Some(json!(11))]
        );
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_on_one_rank() {
        let cluster = cluster(4).await;
        let fail_on = cluster.registry().callable("fail_on").unwrap();
        let err = cluster
            .launch(&fail_on, CallArgs::new().with_arg(2))
            .await
            .unwrap_err();
        let (rank, remote) = err.remote().unwrap();
        assert_eq!(rank, Rank::new(2));
        assert_eq!(remote.kind, RemoteErrorKind::Execution);
        assert_eq!(remote.message, "rank 2 refuses");

        // The failure does not poison the cluster.
        let results = cluster
            .launch(&fail_on, CallArgs::new().with_arg(9))
            .await
            .unwrap();
        assert_eq!(results, vec![json!("ok"); 4]);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cell_failure_reports_lowest_rank() {
        let cluster = cluster(3).await;
        let err = cluster
            .launch_cell("if_missing(rank)")
            .await
            .unwrap_err();
        assert_eq!(err.remote().unwrap().0, Rank::new(0));
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_logs_reach_sink() {
        let sink = MemorySink::new();
        let config = config(2).with_log_sink(Arc::new(sink.clone()));
        let cluster = Cluster::initialize(config).await.unwrap();
        let greet = cluster.registry().callable("greet").unwrap();
        cluster.launch(&greet, CallArgs::new()).await.unwrap();

        let mut lines = sink.lines();
        lines.sort();
        assert_eq!(lines, vec!["[0]: hello from 0", "[1]: hello from 1"]);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_becomes_remote_error() {
        let cluster = cluster(2).await;
        let panic_on = cluster.registry().callable("panic_on").unwrap();
        let err = cluster
            .launch(&panic_on, CallArgs::new().with_arg(1))
            .await
            .unwrap_err();
        let (rank, remote) = err.remote().unwrap();
        assert_eq!(rank, Rank::new(1));
        assert_eq!(remote.kind, RemoteErrorKind::Panicked);
        assert_eq!(remote.message, "rank 1 exploded");
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_and_cancel() {
        let cluster = cluster(2).await;
        let sleep = cluster.registry().callable("sleep_ms").unwrap();

        let options = CallOptions::new().with_timeout(Duration::from_millis(50));
        let err = cluster
            .launch_with(&sleep, CallArgs::new().with_arg(500), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { rank, .. } if rank == Rank::new(0)));

        let token = CancellationToken::new();
        token.cancel();
        let options = CallOptions::new().with_cancel(token);
        let err = cluster
            .launch_cell_with("1", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Cancelled { .. }));

        // Late responses are discarded and the next call still matches up.
        let results = cluster
            .launch(&sleep, CallArgs::new().with_arg(1))
            .await
            .unwrap();
        assert_eq!(results, vec![json!(1), json!(1)]);
        cluster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let cluster = cluster(1).await;
        cluster.close().await.unwrap();
        cluster.close().await.unwrap();

        let rank = Callable::registered("rank");
        assert_eq!(
            cluster.launch(&rank, CallArgs::new()).await.unwrap_err(),
            ClusterError::Uninitialized
        );
        assert_eq!(
            cluster.launch_cell("1").await.unwrap_err(),
            ClusterError::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_zero_workers_fails_before_spawning() {
        let err = Cluster::initialize(config(0)).await.unwrap_err();
        assert!(matches!(err, ClusterError::Config { .. }));
    }

    #[tokio::test]
    async fn test_missing_worker_program() {
        let config = config(2)
            .with_backend(Backend::Process)
            .with_program("/nonexistent/distdev-worker");
        let err = Cluster::initialize(config).await.unwrap_err();
        assert!(matches!(err, ClusterError::Spawn { rank, .. } if rank == Rank::new(0)));
    }
}
