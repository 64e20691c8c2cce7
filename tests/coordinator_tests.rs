//! ServerCoordinator discovery: health probe, lock file validation, and
//! spawn failures.

use std::time::Duration;

use navrelay_host::{
    CoordinatorConfig, CoordinatorError, LockFileVerdict, Ownership, ServerCommand,
    ServerCoordinator, inspect_lock_file,
};
use navrelay_protocol::ClientRegistration;
use navrelay_server::{ServiceConfig, SharedServer};
use serde_json::json;
use tempfile::TempDir;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config(dir: &TempDir, port: u16, command: ServerCommand) -> CoordinatorConfig {
    CoordinatorConfig {
        port,
        lock_file: dir.path().join("navrelay-server.lock"),
        probe_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        startup_timeout: Duration::from_millis(600),
        connect_retry_delay: Duration::from_millis(50),
        server_command: Some(command),
        ..CoordinatorConfig::default()
    }
}

fn missing_program() -> ServerCommand {
    ServerCommand::new("/nonexistent/navrelay").arg("serve")
}

async fn backend(dir: &TempDir) -> SharedServer {
    SharedServer::start(ServiceConfig {
        port: 0,
        idle_shutdown_delay: Duration::from_secs(10),
        lock_file: Some(dir.path().join("navrelay-server.lock")),
        ..ServiceConfig::default()
    })
    .await
    .unwrap()
}

/// Pid of a process that has already exited.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[tokio::test]
async fn uses_backend_answering_on_configured_port() {
    let dir = TempDir::new().unwrap();
    let server = backend(&dir).await;

    let coordinator = ServerCoordinator::new(config(&dir, server.port(), missing_program()));
    assert_eq!(coordinator.ownership(), None);
    assert_eq!(coordinator.ensure_server_available().await.unwrap(), Ownership::External);
    assert_eq!(coordinator.ownership(), Some(Ownership::External));
    assert_eq!(coordinator.port(), server.port());

    server.shutdown().await;
}

#[tokio::test]
async fn adopts_port_from_live_lock_file() {
    let dir = TempDir::new().unwrap();
    let server = backend(&dir).await;

    // Nothing listens on the configured port; the lock file points elsewhere.
    let coordinator = ServerCoordinator::new(config(&dir, free_port(), missing_program()));
    assert_eq!(coordinator.ensure_server_available().await.unwrap(), Ownership::External);
    assert_eq!(coordinator.port(), server.port());

    server.shutdown().await;
}

#[tokio::test]
async fn removes_lock_file_of_dead_process() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("navrelay-server.lock");
    let pid = dead_pid();
    std::fs::write(
        &path,
        json!({
            "serverPid": pid,
            "port": free_port(),
            "startTime": "2026-01-01T00:00:00Z",
            "serverType": "shared-navrelay-server",
            "isDetached": true,
            "clients": [],
            "lastUpdate": "2026-01-01T00:00:00Z",
        })
        .to_string(),
    )
    .unwrap();

    let verdict = inspect_lock_file(
        &reqwest::Client::new(),
        &path,
        "127.0.0.1",
        Duration::from_millis(300),
    )
    .await;
    assert_eq!(verdict, LockFileVerdict::Stale { server_pid: pid });
    assert!(!path.exists());
}

#[tokio::test]
async fn unlaunchable_command_is_a_startup_failure() {
    let dir = TempDir::new().unwrap();
    let coordinator = ServerCoordinator::new(config(&dir, free_port(), missing_program()));

    let err = coordinator.ensure_server_available().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::StartupFailure { .. }), "{err}");
    assert_eq!(coordinator.ownership(), None);

    // Not cached: the next caller tries again.
    assert!(coordinator.ensure_server_available().await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn silent_backend_times_out() {
    let dir = TempDir::new().unwrap();
    let command = ServerCommand::new("sh").args(["-c", "exit 0"]);
    let coordinator = ServerCoordinator::new(config(&dir, free_port(), command));

    let started = std::time::Instant::now();
    let err = coordinator.ensure_server_available().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::StartupFailure { .. }), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[cfg(unix)]
#[tokio::test]
async fn concurrent_callers_share_one_spawn() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("spawns");
    let script = format!("echo spawned >> '{}'", counter.display());
    let command = ServerCommand::new("sh").args(["-c", script.as_str()]);
    let coordinator = ServerCoordinator::new(config(&dir, free_port(), command));

    let attempts: Vec<_> = (0..5)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_server_available().await })
        })
        .collect();
    for attempt in attempts {
        assert!(attempt.await.unwrap().is_err());
    }

    let spawns = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(spawns.lines().count(), 1);
}

#[tokio::test]
async fn rejected_registration_is_reported() {
    let dir = TempDir::new().unwrap();
    let server = backend(&dir).await;
    let coordinator = ServerCoordinator::new(config(&dir, server.port(), missing_program()));

    let blank = ClientRegistration::new("  ", "nowhere", "blank-1", std::process::id());
    let err = coordinator.register_client(&blank).await.unwrap_err();
    match err {
        CoordinatorError::RegistrationFailure { client_id, reason } => {
            assert_eq!(client_id, "blank-1");
            assert!(reason.contains("workspacePath"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(coordinator.registered_clients().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn unregister_leaves_backend_running() {
    let dir = TempDir::new().unwrap();
    let server = backend(&dir).await;
    let coordinator = ServerCoordinator::new(config(&dir, server.port(), missing_program()));

    let registration = ClientRegistration::new("/work/delta", "delta", "delta-1", std::process::id());
    coordinator.register_client(&registration).await.unwrap();
    assert_eq!(coordinator.registered_clients(), ["delta-1"]);
    assert_eq!(server.service().registry().len(), 1);

    coordinator.unregister_client("delta-1").await.unwrap();
    assert!(server.service().registry().is_empty());
    assert!(server.service().state().is_accepting());
    assert!(coordinator.ensure_server_available().await.is_ok());

    server.shutdown().await;
}

#[tokio::test]
async fn lost_channel_forgets_backend_without_session() {
    let dir = TempDir::new().unwrap();
    let server = backend(&dir).await;
    let coordinator = ServerCoordinator::new(config(&dir, server.port(), missing_program()));

    let registration = ClientRegistration::new("/work/echo", "echo", "echo-1", std::process::id());
    let channel = coordinator.register_client(&registration).await.unwrap();
    assert_eq!(coordinator.ownership(), Some(Ownership::External));

    server.shutdown().await;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !channel.is_lost() {
        assert!(std::time::Instant::now() < deadline, "channel never noticed the backend left");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Discovery runs again: nothing answers and the command cannot launch.
    let err = coordinator.ensure_server_available().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::StartupFailure { .. }), "{err}");
    assert_eq!(coordinator.ownership(), None);

    let err = coordinator.register_client(&registration).await.unwrap_err();
    assert!(
        matches!(
            err,
            CoordinatorError::StartupFailure { .. } | CoordinatorError::RegistrationFailure { .. }
        ),
        "{err}"
    );
}
