//! End-to-end tests with real worker processes running the `distdev` binary.

use distdev_cluster::{
    Backend, CallArgs, Callable, Cluster, ClusterConfig, ClusterError, Rank, RemoteErrorKind,
};
use distdev_log::MemorySink;
use serde_json::json;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

const DISTDEV: &str = env!("CARGO_BIN_EXE_distdev");

fn config(nprocs: u32, sink: &MemorySink) -> ClusterConfig {
    ClusterConfig::new(nprocs)
        .with_backend(Backend::Process)
        .with_program(DISTDEV)
        .with_join_timeout(Duration::from_secs(20))
        .with_log_sink(Arc::new(sink.clone()))
}

async fn cluster(nprocs: u32) -> (Cluster, MemorySink) {
    let sink = MemorySink::new();
    let cluster = Cluster::initialize(config(nprocs, &sink)).await.unwrap();
    (cluster, sink)
}

#[tokio::test]
async fn test_process_workers_return_ranks() {
    let (cluster, _) = cluster(3).await;
    let rank = Callable::registered("rank");
    assert_eq!(
        cluster.launch(&rank, CallArgs::new()).await.unwrap(),
        vec![json!(0), json!(1), json!(2)]
    );
    assert_eq!(
        cluster.launch(&rank, CallArgs::new()).await.unwrap(),
        vec![json!(0), json!(1), json!(2)]
    );
    assert_eq!(cluster.installs_sent(), 3);
    cluster.close().await.unwrap();
    assert!(!cluster.is_active());
}

#[tokio::test]
async fn test_failure_names_rank() {
    let (cluster, _) = cluster(3).await;
    let fail_on = Callable::registered("fail_on");
    let err = cluster
        .launch(&fail_on, CallArgs::new().with_arg(1))
        .await
        .unwrap_err();
    let (rank, remote) = err.remote().unwrap();
    assert_eq!(rank, Rank::new(1));
    assert_eq!(remote.kind, RemoteErrorKind::Execution);
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_task_fails_install() {
    let (cluster, _) = cluster(2).await;
    let missing = Callable::registered("no_such_task");
    let err = cluster.launch(&missing, CallArgs::new()).await.unwrap_err();
    let (rank, remote) = err.remote().unwrap();
    assert_eq!(rank, Rank::new(0));
    assert_eq!(remote.kind, RemoteErrorKind::Install);
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_logs_arrive_before_results() {
    let (cluster, sink) = cluster(2).await;
    let log_lines = Callable::registered("log_lines");
    let results = cluster
        .launch(&log_lines, CallArgs::new().with_arg(2))
        .await
        .unwrap();
    assert_eq!(results, vec![json!(2), json!(2)]);

    let lines: Vec<String> = sink
        .lines()
        .into_iter()
        .filter(|l| l.contains(" from rank "))
        .collect();
    assert_eq!(lines.len(), 4);
    for rank in 0..2 {
        let from_rank: Vec<&String> = lines
            .iter()
            .filter(|l| l.starts_with(&format!("[{}]: ", rank)))
            .collect();
        assert_eq!(
            from_rank,
            vec![
                &format!("[{}]: line 0 from rank {}", rank, rank),
                &format!("[{}]: line 1 from rank {}", rank, rank),
            ]
        );
    }
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_cells_persist_across_calls() {
    let (cluster, _) = cluster(2).await;
    assert_eq!(
        cluster.launch_cell("base = square(rank + 2)").await.unwrap(),
        vec![None, None]
    );
    assert_eq!(
        cluster.launch_cell("[base, world_size]").await.unwrap(),
        vec![Some(json!([4, 3])), Some(json!([9, 3]))]
    );
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_worker_keeps_serving() {
    let (cluster, _) = cluster(2).await;
    let panic_on = Callable::registered("panic_on");
    let err = cluster
        .launch(&panic_on, CallArgs::new().with_arg(0))
        .await
        .unwrap_err();
    assert_eq!(err.remote().unwrap().1.kind, RemoteErrorKind::Panicked);

    let square = Callable::registered("square");
    assert_eq!(
        cluster.launch(&square, CallArgs::new()).await.unwrap(),
        vec![json!(0), json!(1)]
    );
    cluster.close().await.unwrap();
    assert_eq!(
        cluster.launch_cell("1").await.unwrap_err(),
        ClusterError::Uninitialized
    );
}

#[test]
fn test_cli_run_prints_results() {
    let output = Command::new(DISTDEV)
        .args(["run", "--nprocs", "2", "square", "3"])
        .env_remove("DISTDEV_BACKEND")
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "0: 9\n1: 9\n");
}

#[test]
fn test_cli_cell_prints_none() {
    let output = Command::new(DISTDEV)
        .args(["cell", "--nprocs", "2", "--backend", "thread", "x = rank"])
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "0: none\n1: none\n");
}

#[test]
fn test_cli_failure_exits_nonzero() {
    let output = Command::new(DISTDEV)
        .args(["run", "-n", "2", "fail_on", "1"])
        .env_remove("DISTDEV_BACKEND")
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Worker 1 failed"));
}

#[test]
fn test_cli_lists_tasks() {
    let output = Command::new(DISTDEV).arg("tasks").env_remove("RUST_LOG").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["rank", "echo", "sleep_ms", "panic_on"] {
        assert!(stdout.lines().any(|l| l.starts_with(name)), "missing {}", name);
    }
}
