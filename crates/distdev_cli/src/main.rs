//! distdev CLI
//!
//! Starts a cluster of workers on this host, runs a built-in task or a cell
//! on every worker and prints the per-rank results. The same binary is the
//! worker program for the process backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod tasks;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use distdev_cluster::{
    Backend, BootstrapEnv, CallArgs, CallOptions, Callable, Cluster, ClusterConfig, worker,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONTROLLER_FILTER: &str = "distdev=info";

#[derive(Parser)]
#[command(name = "distdev")]
#[command(about = "Run tasks and cells on a single-host cluster of workers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ClusterArgs {
    /// Number of workers
    #[arg(short, long, env = "DISTDEV_NPROCS")]
    nprocs: u32,
    /// Worker backend (process, thread)
    #[arg(short, long, env = "DISTDEV_BACKEND", default_value = "process")]
    backend: Backend,
    /// Per-call deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Bootstrap deadline in seconds
    #[arg(long, default_value_t = 30)]
    join_timeout_secs: u64,
}

impl ClusterArgs {
    fn config(&self) -> Result<ClusterConfig> {
        Ok(ClusterConfig::new(self.nprocs)
            .with_backend(self.backend)
            .with_registry(Arc::new(tasks::registry()?))
            .with_join_timeout(Duration::from_secs(self.join_timeout_secs)))
    }

    fn options(&self) -> CallOptions {
        match self.timeout_ms {
            Some(ms) => CallOptions::new().with_timeout(Duration::from_millis(ms)),
            None => CallOptions::new(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in task on every worker
    Run {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Task name
        task: String,
        /// Positional arguments, each a JSON value
        args: Vec<String>,
    },
    /// Run a cell on every worker
    Cell {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Cell source
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        source: Option<String>,
        /// Read the cell from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// List the built-in tasks
    Tasks,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    if let Some(env) = BootstrapEnv::from_env()? {
        let registry = Arc::new(tasks::registry()?);
        worker::run_process(env, registry)?;
        return Ok(());
    }

    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Run {
            cluster,
            task,
            args,
        } => {
            let args = parse_args(&args)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_task(cluster, task, args))
        }
        Commands::Cell {
            cluster,
            source,
            file,
        } => {
            let source = match (source, file) {
                (Some(source), _) => source,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .wrap_err_with(|| format!("cannot read {}", path.display()))?,
                (None, None) => return Err(eyre!("a cell source or --file is required")),
            };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_cell(cluster, source))
        }
        Commands::Tasks => {
            for (name, description) in tasks::BUILTIN_TASKS {
                println!("{:<12} {}", name, description);
            }
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_CONTROLLER_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args(raw: &[String]) -> Result<CallArgs> {
    let values = raw
        .iter()
        .map(|arg| {
            serde_json::from_str::<Value>(arg)
                .wrap_err_with(|| format!("argument {:?} is not valid JSON", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CallArgs::positional(values))
}

async fn run_task(args: ClusterArgs, task: String, call_args: CallArgs) -> Result<()> {
    let cluster = Cluster::initialize(args.config()?).await?;
    let callable = cluster
        .registry()
        .callable(&task)
        .ok_or_else(|| eyre!("unknown task '{}'; see `distdev tasks`", task));

    let outcome = match callable {
        Ok(callable) => cluster
            .launch_with(&callable, call_args, &args.options())
            .await
            .map_err(Into::into),
        Err(e) => Err(e),
    };
    cluster.close().await?;

    for (rank, value) in outcome?.into_iter().enumerate() {
        println!("{}: {}", rank, value);
    }
    Ok(())
}

async fn run_cell(args: ClusterArgs, source: String) -> Result<()> {
    let cluster = Cluster::initialize(args.config()?).await?;
    let outcome = cluster.launch_cell_with(&source, &args.options()).await;
    cluster.close().await?;

    for (rank, value) in outcome?.into_iter().enumerate() {
        match value {
            Some(value) => println!("{}: {}", rank, value),
            None => println!("{}: none", rank),
        }
    }
    Ok(())
}
