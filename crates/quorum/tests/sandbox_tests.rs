//! Sandbox isolation tests.
//!
//! These need a working container runtime; they skip silently when
//! docker is unavailable (the same gating the rest of the suite uses
//! for host-dependent behavior).

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use quorum::sandbox::{ContainerCli, ResourceLimits, Sandbox, SandboxConfig};
use quorum::{
    AgentPool, BreakerConfig, CircuitBreaker, PoolConfig, SandboxError, SandboxManager,
    SessionConfig, SessionOrchestrator,
};

use common::MockAgent;

const TEST_IMAGE: &str = "ubuntu:24.04";

/// True when a runtime is installed and the test image is available
/// (pulling it if needed).
async fn sandbox_ready() -> bool {
    let version_ok = tokio::process::Command::new("docker")
        .arg("version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !version_ok {
        return false;
    }

    let inspect_ok = tokio::process::Command::new("docker")
        .args(["image", "inspect", TEST_IMAGE])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if inspect_ok {
        return true;
    }

    tokio::process::Command::new("docker")
        .args(["pull", TEST_IMAGE])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn cleanup_container(name: &str) {
    let _ = tokio::process::Command::new("docker")
        .args(["rm", "-f", name])
        .output()
        .await;
}

fn test_sandbox(user_id: &str, workspace: &std::path::Path) -> Sandbox {
    Sandbox::new(
        ContainerCli::detect().unwrap(),
        user_id,
        workspace.to_path_buf(),
        TEST_IMAGE,
        ResourceLimits::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn command_runs_with_captured_output_and_exit_code() {
    if !sandbox_ready().await {
        eprintln!("skipping: container runtime unavailable");
        return;
    }
    let workspace = tempfile::tempdir().unwrap();
    let sandbox = test_sandbox("it-exec", workspace.path());
    let cancel = CancellationToken::new();

    let output = sandbox.execute("echo hi; echo oops >&2", &cancel).await.unwrap();
    assert_eq!(output.stdout.trim(), "hi");
    assert_eq!(output.stderr.trim(), "oops");
    assert_eq!(output.exit_code, 0);

    let failing = sandbox.execute("exit 3", &cancel).await.unwrap();
    assert_eq!(failing.exit_code, 3);

    sandbox.stop().await.unwrap();
    cleanup_container(sandbox.container_name()).await;
}

#[tokio::test]
async fn writes_outside_workspace_are_blocked() {
    if !sandbox_ready().await {
        eprintln!("skipping: container runtime unavailable");
        return;
    }
    let workspace = tempfile::tempdir().unwrap();
    let sandbox = test_sandbox("it-rootfs", workspace.path());
    let cancel = CancellationToken::new();

    // Workspace mount is read-only.
    let ws = sandbox.execute("touch /workspace/escape", &cancel).await.unwrap();
    assert_ne!(ws.exit_code, 0);

    // Root filesystem is read-only.
    let root = sandbox.execute("touch /usr/escape", &cancel).await.unwrap();
    assert_ne!(root.exit_code, 0);

    // The tmpfs scratch area is the only writable location.
    let tmp = sandbox.execute("touch /tmp/scratch", &cancel).await.unwrap();
    assert_eq!(tmp.exit_code, 0);

    cleanup_container(sandbox.container_name()).await;
}

#[tokio::test]
async fn network_is_disabled_by_default() {
    if !sandbox_ready().await {
        eprintln!("skipping: container runtime unavailable");
        return;
    }
    let workspace = tempfile::tempdir().unwrap();
    let sandbox = test_sandbox("it-net", workspace.path());
    let cancel = CancellationToken::new();

    let output = sandbox
        .execute("timeout 2 bash -c 'echo > /dev/tcp/1.1.1.1/80'", &cancel)
        .await
        .unwrap();
    assert_ne!(output.exit_code, 0);

    cleanup_container(sandbox.container_name()).await;
}

#[tokio::test]
async fn cancellation_kills_the_inflight_command() {
    if !sandbox_ready().await {
        eprintln!("skipping: container runtime unavailable");
        return;
    }
    let workspace = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(test_sandbox("it-cancel", workspace.path()));
    let cancel = CancellationToken::new();

    let exec = {
        let sandbox = sandbox.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { sandbox.execute("sleep 30", &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), exec)
        .await
        .expect("cancelled exec must return promptly")
        .unwrap();
    assert!(matches!(result, Err(SandboxError::Cancelled)));

    cleanup_container(sandbox.container_name()).await;
}

#[tokio::test]
async fn start_is_idempotent_and_info_degrades_gracefully() {
    if !sandbox_ready().await {
        eprintln!("skipping: container runtime unavailable");
        return;
    }
    let workspace = tempfile::tempdir().unwrap();
    let sandbox = test_sandbox("it-lifecycle", workspace.path());

    // Before any start: info reports "not created" instead of failing.
    cleanup_container(sandbox.container_name()).await;
    let info = sandbox.info().await;
    assert_eq!(info.status, "not created");

    sandbox.start().await.unwrap();
    sandbox.start().await.unwrap();

    let info = sandbox.info().await;
    assert_eq!(info.status, "running");
    assert_eq!(info.container_name, "sandbox-it-lifecycle");

    sandbox.stop().await.unwrap();
    cleanup_container(sandbox.container_name()).await;
}

#[tokio::test]
async fn shell_escape_streams_sandbox_output_through_orchestrator() {
    if !sandbox_ready().await {
        eprintln!("skipping: container runtime unavailable");
        return;
    }
    let agent = MockAgent::start().await;
    let workspace = tempfile::tempdir().unwrap();

    let sandbox_config = SandboxConfig {
        image: TEST_IMAGE.to_string(),
        workspace_root: workspace.path().to_path_buf(),
        ..Default::default()
    };
    let orchestrator = SessionOrchestrator::new(
        SessionConfig::default(),
        AgentPool::new(
            PoolConfig {
                batch_delay: Duration::from_millis(20),
                ..Default::default()
            },
            agent.client_config(),
        ),
        CircuitBreaker::new("remote-agent", BreakerConfig::default()),
        SandboxManager::new(sandbox_config),
    );

    let session = orchestrator
        .create_user_session("it-shell", None, None)
        .await
        .unwrap();

    let mut stream = orchestrator
        .send_message_streaming("it-shell", &session, "!echo hi")
        .await
        .unwrap();

    let mut text = String::new();
    while let Some(item) = stream.next().await {
        text.push_str(&item.unwrap());
    }

    // The sandbox ran the command: formatted output with the exit code,
    // and the remote agent was never involved.
    assert!(text.contains("hi"));
    assert!(text.contains("exit code: 0"));
    assert_eq!(
        agent.counters.chat_sends.load(std::sync::atomic::Ordering::SeqCst),
        0
    );

    let execution = orchestrator.execution_session("it-shell").unwrap();
    assert_eq!(execution.container_name, "sandbox-it-shell");
    assert!(!execution.resource_limits.network_access);

    orchestrator.shutdown().await;
    cleanup_container("sandbox-it-shell").await;
}
