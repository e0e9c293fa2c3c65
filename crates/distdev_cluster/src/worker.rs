//! Worker bootstrap and the callee loop.
//!
//! A worker binds its mesh listener, joins the process group, completes
//! the mesh handshake with the controller and then serves requests one at a
//! time until the controller asks it to shut down.

use crate::mesh::{Inbound, MeshListener, WorkerConnection};
use crate::remote::{RemoteOp, RemoteRequest, RemoteResponse, ShippedUnit, UnitSource};
use crate::rendezvous::GroupMembership;
use crate::task::{CallArgs, Task, TaskContext, TaskRegistry};
use distdev_cell::{CellError, CellResult, Host, Interpreter, Program};
use distdev_core::{BootstrapEnv, ClusterError, ClusterResult, RemoteError, RemoteErrorKind};
use distdev_log::{LogReceiver, install_worker_logging, log_channel, worker_subscriber};
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started
    Uninitialized,
    /// Joining the process group and call mesh
    Joining,
    /// Serving calls
    Serving,
    /// Acknowledging shutdown and leaving
    ShuttingDown,
    /// Bootstrap routine returned
    Terminated,
}

/// Entry point for a worker process.
///
/// Replaces the process-wide logging subscriber, runs the worker on a
/// single-threaded runtime and returns once the worker has terminated.
///
/// # Errors
///
/// Returns the bootstrap or transport error that ended the worker
pub fn run_process(env: BootstrapEnv, registry: Arc<TaskRegistry>) -> ClusterResult<()> {
    let (tx, rx) = log_channel();
    install_worker_logging(env.rank, tx).map_err(|e| ClusterError::Config {
        reason: format!("cannot install worker logging: {}", e),
    })?;
    block_on(Worker::new(env, registry), rx)
}

/// Entry point for a worker running on its own thread inside another process.
///
/// Logging is redirected for this thread only. Cancelling `cancel` while the
/// worker is still joining makes it give up with [`ClusterError::Cancelled`].
///
/// # Errors
///
/// Returns the bootstrap or transport error that ended the worker
pub fn run_thread(
    env: BootstrapEnv,
    registry: Arc<TaskRegistry>,
    cancel: CancellationToken,
) -> ClusterResult<()> {
    let (tx, rx) = log_channel();
    let _logging = tracing::subscriber::set_default(worker_subscriber(env.rank, tx));
    block_on(Worker::new(env, registry).with_cancel(cancel), rx)
}

fn block_on(worker: Worker, logs: LogReceiver) -> ClusterResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ClusterError::Spawn {
            rank: worker.env.rank,
            reason: format!("cannot build worker runtime: {}", e),
        })?;
    runtime.block_on(worker.run(logs))
}

/// One worker's bootstrap state and namespace
pub struct Worker {
    env: BootstrapEnv,
    state: WorkerState,
    namespace: Namespace,
    cancel: CancellationToken,
}

impl Worker {
    /// Create a worker that has not joined yet
    #[must_use]
    pub fn new(env: BootstrapEnv, registry: Arc<TaskRegistry>) -> Self {
        let ctx = TaskContext {
            rank: env.rank,
            world_size: env.topology.world_size(),
        };
        Self {
            env,
            state: WorkerState::Uninitialized,
            namespace: Namespace::new(ctx, registry),
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon joining once `cancel` fires
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::debug!(rank = %self.env.rank, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    /// Join, serve until shutdown, then leave.
    ///
    /// `logs` is the consumer half of the channel this worker's logging
    /// subscriber writes to.
    ///
    /// # Errors
    ///
    /// Returns the first bootstrap or transport error
    pub async fn run(mut self, logs: LogReceiver) -> ClusterResult<()> {
        self.transition(WorkerState::Joining);
        let cancel = self.cancel.clone();
        let joined = tokio::select! {
            joined = self.join(logs) => Some(joined),
            () = cancel.cancelled() => None,
        };
        let Some(joined) = joined else {
            tracing::debug!(rank = %self.env.rank, "join cancelled");
            self.transition(WorkerState::Terminated);
            return Err(ClusterError::Cancelled { rank: self.env.rank });
        };
        let (group, mut conn) = joined?;

        self.transition(WorkerState::Serving);
        let acknowledged = loop {
            match conn.next().await? {
                Some(Inbound::Request(request)) => {
                    let response = self.namespace.dispatch(request);
                    conn.respond(response).await?;
                }
                Some(Inbound::Malformed { id, reason }) => {
                    tracing::error!("cannot decode request {}: {}", id, reason);
                    let error = RemoteError::new(RemoteErrorKind::Protocol, reason);
                    conn.respond(RemoteResponse::error(id, error)).await?;
                }
                Some(Inbound::Shutdown) => break true,
                None => break false,
            }
        };

        self.transition(WorkerState::ShuttingDown);
        if acknowledged {
            conn.acknowledge_shutdown().await?;
        } else {
            tracing::debug!(rank = %self.env.rank, "controller closed the connection");
            drop(conn);
        }
        group.leave().await;

        self.transition(WorkerState::Terminated);
        Ok(())
    }

    async fn join(&self, logs: LogReceiver) -> ClusterResult<(GroupMembership, WorkerConnection)> {
        let listener = MeshListener::bind().await?;
        let mesh_addr = listener.local_addr()?;
        let group = GroupMembership::join(&self.env, mesh_addr).await?;
        let conn = listener
            .accept(self.env.rank, self.env.topology, logs, self.env.join_timeout)
            .await?;
        Ok((group, conn))
    }
}

enum Installed {
    Task(Arc<dyn Task>),
    Script(Program),
}

/// Worker-side execution namespace
struct Namespace {
    ctx: TaskContext,
    registry: Arc<TaskRegistry>,
    installed: IndexMap<Uuid, Installed>,
    /// Latest identity installed under each name, for calls from cells
    names: HashMap<String, Uuid>,
    interpreter: Interpreter,
}

impl Namespace {
    fn new(ctx: TaskContext, registry: Arc<TaskRegistry>) -> Self {
        let interpreter = Interpreter::new()
            .with_global("rank", json!(ctx.rank.as_u32()))
            .with_global("world_size", json!(ctx.world_size));
        Self {
            ctx,
            registry,
            installed: IndexMap::new(),
            names: HashMap::new(),
            interpreter,
        }
    }

    fn dispatch(&mut self, request: RemoteRequest) -> RemoteResponse {
        let RemoteRequest { id, op } = request;
        let kind = op.kind();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(op)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!("{} panicked: {}", kind, message);
                Err(RemoteError::new(RemoteErrorKind::Panicked, message))
            });
        RemoteResponse { id, outcome }
    }

    fn execute(&mut self, op: RemoteOp) -> Result<Option<Value>, RemoteError> {
        match op {
            RemoteOp::Install(unit) => self.install(unit).map(|()| None),
            RemoteOp::Invoke { id, name, args } => self.invoke(id, &name, &args).map(Some),
            RemoteOp::ExecCell { source } => self.exec_cell(&source),
            RemoteOp::Ping => Ok(None),
        }
    }

    fn install(&mut self, unit: ShippedUnit) -> Result<(), RemoteError> {
        let installed = match &unit.source {
            UnitSource::Registered => self
                .registry
                .get(&unit.name)
                .map(Installed::Task)
                .ok_or_else(|| format!("no task named '{}' is registered", unit.name)),
            UnitSource::Script(text) => distdev_cell::parse(text)
                .map(Installed::Script)
                .map_err(|e| e.to_string()),
        };

        match installed {
            Ok(installed) => {
                self.installed.insert(unit.id, installed);
                self.names.insert(unit.name, unit.id);
                Ok(())
            }
            Err(message) => {
                tracing::error!("failed to install {}: {}\n{}", unit.name, message, unit.source_text());
                Err(RemoteError::new(RemoteErrorKind::Install, message))
            }
        }
    }

    fn invoke(&mut self, id: Uuid, name: &str, args: &CallArgs) -> Result<Value, RemoteError> {
        let Some(installed) = self.installed.get(&id) else {
            return Err(RemoteError::new(
                RemoteErrorKind::NotInstalled,
                format!("'{}' has not been installed on this worker", name),
            ));
        };

        let result = match installed {
            Installed::Task(task) => task.call(&self.ctx, args).map_err(|e| e.to_string()),
            Installed::Script(program) => {
                let host = self.host();
                self.interpreter
                    .call_script(program, args.args.clone(), args.kwargs.clone(), &host)
                    .map_err(|e| e.to_string())
            }
        };

        result.map_err(|message| {
            let source = match installed {
                Installed::Task(_) => name.to_string(),
                Installed::Script(_) => format!("script '{}'", name),
            };
            tracing::error!("{} failed: {}", source, message);
            RemoteError::new(RemoteErrorKind::Execution, message)
        })
    }

    fn host(&self) -> WorkerHost<'_> {
        WorkerHost {
            ctx: self.ctx,
            registry: &self.registry,
            installed: &self.installed,
            names: &self.names,
        }
    }

    fn exec_cell(&mut self, source: &str) -> Result<Option<Value>, RemoteError> {
        let host = WorkerHost {
            ctx: self.ctx,
            registry: &self.registry,
            installed: &self.installed,
            names: &self.names,
        };
        self.interpreter.run_source(source, &host).map_err(|e| {
            tracing::error!("cell failed: {}\n{}", e, source);
            RemoteError::new(RemoteErrorKind::Execution, e.to_string())
        })
    }
}

/// Resolves cell function calls to installed and registered tasks
struct WorkerHost<'a> {
    ctx: TaskContext,
    registry: &'a TaskRegistry,
    installed: &'a IndexMap<Uuid, Installed>,
    names: &'a HashMap<String, Uuid>,
}

impl Host for WorkerHost<'_> {
    fn call(&self, name: &str, args: &[Value]) -> Option<CellResult<Value>> {
        let bound = self.names.get(name).and_then(|id| self.installed.get(id));
        let task = match bound {
            Some(Installed::Task(task)) => Arc::clone(task),
            Some(Installed::Script(_)) => {
                return Some(Err(CellError::Type(format!(
                    "script '{}' cannot be called from a cell",
                    name
                ))));
            }
            None => self.registry.get(name)?,
        };
        let args = CallArgs::positional(args.to_vec());
        Some(task.call(&self.ctx, &args).map_err(|e| CellError::Host {
            function: name.to_string(),
            message: e.to_string(),
        }))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Callable, TaskError};
    use distdev_core::{Rank, Topology};

    fn namespace() -> Namespace {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("rank", |ctx, _| Ok(json!(ctx.rank.as_u32())))
            .unwrap();
        registry
            .register_fn("add", |_, args| Ok(json!(args.int(0)? + args.int(1)?)))
            .unwrap();
        registry
            .register_fn("boom", |_, _| -> Result<Value, TaskError> { panic!("kaboom") })
            .unwrap();
        let ctx = TaskContext {
            rank: Rank::new(2),
            world_size: 4,
        };
        Namespace::new(ctx, Arc::new(registry))
    }

    fn request(op: RemoteOp) -> RemoteRequest {
        RemoteRequest { id: 1, op }
    }

    fn install(ns: &mut Namespace, callable: &Callable) -> Result<Option<Value>, RemoteError> {
        ns.dispatch(request(RemoteOp::Install(callable.unit()))).outcome
    }

    fn invoke(ns: &mut Namespace, callable: &Callable, args: CallArgs) -> Result<Option<Value>, RemoteError> {
        ns.dispatch(request(RemoteOp::Invoke {
            id: callable.id(),
            name: callable.name().to_string(),
            args,
        }))
        .outcome
    }

    fn cell(ns: &mut Namespace, source: &str) -> Result<Option<Value>, RemoteError> {
        ns.dispatch(request(RemoteOp::ExecCell {
            source: source.into(),
        }))
        .outcome
    }

    #[test]
    fn test_registered_task_round_trip() {
        let mut ns = namespace();
        let rank = Callable::registered("rank");
        assert_eq!(install(&mut ns, &rank), Ok(None));
        assert_eq!(invoke(&mut ns, &rank, CallArgs::new()), Ok(Some(json!(2))));
    }

    #[test]
    fn test_unknown_registered_task_fails_install() {
        let mut ns = namespace();
        let err = install(&mut ns, &Callable::registered("missing")).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Install);
    }

    #[test]
    fn test_invoke_before_install() {
        let mut ns = namespace();
        let err = invoke(&mut ns, &Callable::registered("rank"), CallArgs::new()).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotInstalled);
    }

    #[test]
    fn test_script_callable_uses_args_and_globals() {
        let mut ns = namespace();
        let scale = Callable::script("scale", "args[0] * rank");
        install(&mut ns, &scale).unwrap();
        assert_eq!(
            invoke(&mut ns, &scale, CallArgs::new().with_arg(5)),
            Ok(Some(json!(10)))
        );
    }

    #[test]
    fn test_script_syntax_error_fails_install() {
        let mut ns = namespace();
        let err = install(&mut ns, &Callable::script("bad", "1 +")).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Install);
        assert!(err.message.starts_with("SyntaxError"));
    }

    #[test]
    fn test_same_name_callables_keep_their_bodies() {
        let mut ns = namespace();
        let first = Callable::script("f", "1");
        let second = Callable::script("f", "2");
        install(&mut ns, &first).unwrap();
        install(&mut ns, &second).unwrap();
        assert_eq!(invoke(&mut ns, &first, CallArgs::new()), Ok(Some(json!(1))));
        assert_eq!(invoke(&mut ns, &second, CallArgs::new()), Ok(Some(json!(2))));
    }

    #[test]
    fn test_cells_call_installed_task_by_name() {
        let mut ns = namespace();
        install(&mut ns, &Callable::registered("add")).unwrap();
        assert_eq!(cell(&mut ns, "add(1, 2)"), Ok(Some(json!(3))));

        install(&mut ns, &Callable::script("helper", "1")).unwrap();
        let err = cell(&mut ns, "helper()").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Execution);
    }

    #[test]
    fn test_cells_share_globals_and_call_tasks() {
        let mut ns = namespace();
        assert_eq!(cell(&mut ns, "x = add(rank, 1)"), Ok(None));
        assert_eq!(cell(&mut ns, "x * world_size"), Ok(Some(json!(12))));
    }

    #[test]
    fn test_cell_error_is_execution_failure() {
        let mut ns = namespace();
        let err = cell(&mut ns, "fail('rank ' + str(rank) + ' refuses')").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Execution);
        assert_eq!(err.message, "rank 2 refuses");
    }

    #[test]
    fn test_panic_is_reported() {
        let mut ns = namespace();
        let boom = Callable::registered("boom");
        install(&mut ns, &boom).unwrap();
        let err = invoke(&mut ns, &boom, CallArgs::new()).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Panicked);
        assert_eq!(err.message, "kaboom");

        // The namespace is still usable.
        assert_eq!(cell(&mut ns, "1 + 1"), Ok(Some(json!(2))));
    }

    #[test]
    fn test_new_worker_is_uninitialized() {
        let env = BootstrapEnv::new(Rank::new(0), Topology::new(1).unwrap(), 1);
        let worker = Worker::new(env, Arc::new(TaskRegistry::new()));
        assert_eq!(worker.state(), WorkerState::Uninitialized);
    }
}
