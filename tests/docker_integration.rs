//! End-to-end runs against a real container daemon.
//!
//! These tests pull images and start containers.
//! Run with: cargo test --test docker_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use solution_runner::config::RunnerConfig;
use solution_runner::{DockerClient, ExecutionBroker, SubmissionStatus, SubmitRequest};

fn create_test_broker() -> ExecutionBroker {
    create_broker_with(RunnerConfig::default())
}

fn create_broker_with(config: RunnerConfig) -> ExecutionBroker {
    let host = std::env::var("RUNNER_DOCKER_HOST").ok();
    let client = DockerClient::connect(host.as_deref())
        .expect("container daemon must be reachable for integration tests");
    ExecutionBroker::new(Arc::new(config), Arc::new(client))
}

/// Compilers need room for their build cache and intermediates.
fn compiler_config() -> RunnerConfig {
    RunnerConfig {
        scratch_size_mb: 512,
        pids_limit: 256,
        ..RunnerConfig::default()
    }
}

async fn settle(broker: &ExecutionBroker) {
    while broker.governor_snapshot().admitted > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test docker_integration -- --ignored
async fn test_python_sum_of_range() {
    let broker = create_test_broker();

    let request = SubmitRequest::new("python", "print(sum(range(100)))")
        .with_time_limit(10)
        .with_memory_mb(128);
    let id = broker.submit(request).expect("Should be admitted");

    // First run may pull the image.
    let result = tokio::time::timeout(Duration::from_secs(300), broker.wait_result(&id))
        .await
        .expect("Should finish")
        .expect("Should be tracked");

    assert_eq!(result.status, SubmissionStatus::Done, "{:?}", result);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "4950\n");
    assert!(!result.stdout_truncated);
    settle(&broker).await;
}

#[tokio::test]
#[ignore]
async fn test_infinite_loop_times_out() {
    let broker = create_test_broker();

    let request = SubmitRequest::new("python", "while True:\n    pass\n").with_time_limit(2);
    let id = broker.submit(request).expect("Should be admitted");

    let result = tokio::time::timeout(Duration::from_secs(300), broker.wait_result(&id))
        .await
        .expect("Should finish")
        .expect("Should be tracked");

    assert_eq!(result.status, SubmissionStatus::Timeout);
    let runtime_ms = result.runtime_ms.expect("Should record runtime");
    assert!(runtime_ms >= 2000, "fired early: {runtime_ms} ms");
    settle(&broker).await;
}

#[tokio::test]
#[ignore]
async fn test_large_allocation_exceeds_memory() {
    let broker = create_test_broker();

    let request = SubmitRequest::new("python", "x = bytearray(500 * 1024 * 1024)\nprint(len(x))")
        .with_time_limit(10)
        .with_memory_mb(1);
    let id = broker.submit(request).expect("Should be admitted");

    let result = tokio::time::timeout(Duration::from_secs(300), broker.wait_result(&id))
        .await
        .expect("Should finish")
        .expect("Should be tracked");

    assert_eq!(result.status, SubmissionStatus::MemoryExceeded, "{:?}", result);
    settle(&broker).await;
}

#[tokio::test]
#[ignore]
async fn test_go_compiles_on_read_only_root() {
    let broker = create_broker_with(compiler_config());

    let source = "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(6 * 7)\n}\n";
    let request = SubmitRequest::new("go", source)
        .with_time_limit(60)
        .with_memory_mb(512);
    let id = broker.submit(request).expect("Should be admitted");

    let result = tokio::time::timeout(Duration::from_secs(600), broker.wait_result(&id))
        .await
        .expect("Should finish")
        .expect("Should be tracked");

    assert_eq!(result.status, SubmissionStatus::Done, "{:?}", result);
    assert_eq!(result.exit_code, Some(0), "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "42\n");
    settle(&broker).await;
}

#[tokio::test]
#[ignore]
async fn test_cpp_compiles_on_read_only_root() {
    let broker = create_broker_with(compiler_config());

    let source = "#include <iostream>\nint main() { std::cout << 6 * 7 << std::endl; }\n";
    let request = SubmitRequest::new("cpp", source)
        .with_time_limit(60)
        .with_memory_mb(512);
    let id = broker.submit(request).expect("Should be admitted");

    let result = tokio::time::timeout(Duration::from_secs(600), broker.wait_result(&id))
        .await
        .expect("Should finish")
        .expect("Should be tracked");

    assert_eq!(result.status, SubmissionStatus::Done, "{:?}", result);
    assert_eq!(result.exit_code, Some(0), "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "42\n");
    settle(&broker).await;
}
