/// Integration tests for the Docker runner
///
/// These tests need a local Docker daemon and pull `alpine`:
/// 1. Deadlines kill the container and report `timeout`
/// 2. stdout and stderr are demultiplexed and capped
/// 3. Bind mounts honor read-only and read-write
/// 4. Cancellation kills the container
/// 5. Containers are gone once a run returns

use super::copy::copy_dir_contents_in_container;
use super::run::{ContainerRunner, DockerRunner, MountInfo, RunRequest};
use crate::lockmanager::LockManager;
use autograder_common::config::AutograderConfig;
use bollard::container::ListContainersOptions;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TEST_IMAGE: &str = "alpine:3.20";

fn runner_with(config: AutograderConfig) -> DockerRunner {
    DockerRunner::connect(Arc::new(LockManager::new()), &config).expect("Failed to connect to Docker")
}

fn runner() -> DockerRunner {
    runner_with(AutograderConfig::default())
}

fn shell(base_name: &str, script: &str, max_secs: u64) -> RunRequest {
    RunRequest {
        image: TEST_IMAGE.to_string(),
        args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        base_name: base_name.to_string(),
        max_secs,
        ..Default::default()
    }
}

async fn containers_named(runner: &DockerRunner, name: &str) -> usize {
    let mut filters = HashMap::new();
    filters.insert("name", vec![name]);

    runner
        .docker()
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .expect("Failed to list containers")
        .len()
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_timeout_kills_and_removes() {
    let runner = runner();

    let output = runner
        .run_container(&shell("timeout-test", "sleep 10", 1), &CancellationToken::new())
        .await
        .unwrap();

    assert!(output.timeout);
    assert!(!output.succeeded());
    assert!(output.run_time_ms < 10_000);
    assert_eq!(containers_named(&runner, "timeout-test").await, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_streams_and_exit_code() {
    let runner = runner();

    let output = runner
        .run_container(&shell("streams-test", "echo out; echo err 1>&2; exit 3", 10), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(output.stdout, "out\n");
    assert_eq!(output.stderr, "err\n");
    assert_eq!(output.exit_code, Some(3));
    assert!(!output.timeout);
    assert_eq!(containers_named(&runner, "streams-test").await, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_output_is_capped() {
    let runner = runner_with(AutograderConfig {
        docker_max_output_kb: 1,
        ..Default::default()
    });

    let output = runner
        .run_container(&shell("cap-test", "head -c 5000 /dev/zero | tr '\\0' a", 10), &CancellationToken::new())
        .await
        .unwrap();

    assert!(output.stdout.starts_with(&"a".repeat(1024)));
    assert!(output.stdout.contains("output has been truncated"));
    assert_eq!(output.exit_code, Some(0));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_mounts() {
    let runner = runner();
    let input = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();
    fs::write(input.path().join("x.txt"), "hello").unwrap();
    autograder_common::fsutil::recursive_chmod(output_dir.path(), 0o666, 0o777).unwrap();

    let mut request = shell("mount-test", "cat /in/x.txt > /out/y.txt && ! touch /in/z.txt", 10);
    request.mounts = vec![
        MountInfo::read_only(input.path(), "/in"),
        MountInfo::read_write(output_dir.path(), "/out"),
    ];

    let output = runner.run_container(&request, &CancellationToken::new()).await.unwrap();

    assert!(output.succeeded(), "stderr: {}", output.stderr);
    assert_eq!(fs::read_to_string(output_dir.path().join("y.txt")).unwrap(), "hello");
    assert!(!input.path().join("z.txt").exists());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_cancel_kills_container() {
    let runner = runner();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let output = runner
        .run_container(&shell("cancel-test", "sleep 10", 30), &cancel)
        .await
        .unwrap();

    assert!(output.canceled);
    assert!(!output.timeout);
    assert_eq!(containers_named(&runner, "cancel-test").await, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_copy_in_container() {
    let runner = runner();
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    fs::create_dir(source.path().join("nested")).unwrap();
    fs::write(source.path().join("nested").join("a.txt"), "A").unwrap();
    autograder_common::fsutil::recursive_chmod(source.path(), 0o666, 0o777).unwrap();

    copy_dir_contents_in_container(Some(&runner), TEST_IMAGE, source.path(), dest.path(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(dest.path().join("nested").join("a.txt")).unwrap(), "A");
}
