//! Cluster construction parameters.

use crate::task::TaskRegistry;
use distdev_core::{Backend, ClusterError, ClusterResult, DEFAULT_JOIN_TIMEOUT, Topology};
use distdev_log::{LogSink, StdoutSink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default time workers get to acknowledge shutdown before they are killed
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Cluster configuration
#[derive(Clone)]
pub struct ClusterConfig {
    /// How workers are launched
    pub backend: Backend,
    /// Number of workers
    pub nprocs: u32,
    /// Tasks available to registered callables
    pub registry: Arc<TaskRegistry>,
    /// Worker executable for the process backend; the current executable when unset
    pub program: Option<PathBuf>,
    /// Extra arguments passed to every worker process
    pub program_args: Vec<String>,
    /// Deadline for each bootstrap phase
    pub join_timeout: Duration,
    /// Grace period for shutdown before workers are killed
    pub shutdown_grace: Duration,
    /// Where aggregated worker logs go
    pub log_sink: Arc<dyn LogSink>,
}

impl ClusterConfig {
    /// Configuration for `nprocs` workers on the default backend
    #[must_use]
    pub fn new(nprocs: u32) -> Self {
        Self {
            backend: Backend::default(),
            nprocs,
            registry: Arc::new(TaskRegistry::new()),
            program: None,
            program_args: Vec::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_sink: Arc::new(StdoutSink),
        }
    }

    /// Set the backend
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the task registry
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Set the worker executable
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Set extra worker arguments
    #[must_use]
    pub fn with_program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the bootstrap deadline
    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the log sink
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Check the configuration and derive the topology
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] for a zero worker count or a zero deadline
    pub fn validate(&self) -> ClusterResult<Topology> {
        if self.join_timeout.is_zero() {
            return Err(ClusterError::Config {
                reason: "join timeout must be positive".to_string(),
            });
        }
        Topology::new(self.nprocs)
    }

    /// Worker executable for the process backend
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] if no program is set and the current
    /// executable cannot be determined
    pub fn worker_program(&self) -> ClusterResult<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().map_err(|e| ClusterError::Config {
                reason: format!("cannot determine worker program: {}", e),
            }),
        }
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("backend", &self.backend)
            .field("nprocs", &self.nprocs)
            .field("registry", &self.registry)
            .field("program", &self.program)
            .field("program_args", &self.program_args)
            .field("join_timeout", &self.join_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}
