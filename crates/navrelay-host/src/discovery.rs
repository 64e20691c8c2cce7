//! Finding a live backend: health probe first, lock file second.
//!
//! The lock file is never trusted on its own. A record counts only when its
//! `serverPid` is a running process *and* the recorded port answers a health
//! probe. A record whose process is gone is deleted.

use std::path::Path;
use std::time::Duration;

use navrelay_protocol::{HEALTH_PATH, HealthStatus, LockFileRecord, SERVER_IDENTITY};
use reqwest::Client;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, trace, warn};

/// Probe `{base_url}/health`. `None` unless a navrelay backend answers OK
/// within `timeout`.
pub async fn probe_health(client: &Client, base_url: &str, timeout: Duration) -> Option<HealthStatus> {
    let url = format!("{base_url}{HEALTH_PATH}");
    let response = match client.get(&url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            trace!("Health probe {url} failed: {e}");
            return None;
        }
    };

    if !response.status().is_success() {
        debug!("Health probe {url} returned {}", response.status());
        return None;
    }

    match response.json::<HealthStatus>().await {
        Ok(health) if is_usable(&health) => Some(health),
        Ok(health) if health.server == SERVER_IDENTITY => {
            debug!("Shared server behind {url} is {}; not using it", health.state);
            None
        }
        Ok(health) => {
            warn!(
                "Port behind {url} is held by {} (status {})",
                health.server, health.status
            );
            None
        }
        Err(e) => {
            warn!("Health probe {url} answered with an unexpected body: {e}");
            None
        }
    }
}

/// A navrelay backend that will still accept registrations. One that is
/// starting up or already terminating does not count.
pub fn is_usable(health: &HealthStatus) -> bool {
    health.is_ok() && health.server == SERVER_IDENTITY && health.state.is_accepting()
}

/// Whether `pid` names a running process.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

pub fn read_lock_file(path: &Path) -> Option<LockFileRecord> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring unreadable lock file {}: {e}", path.display());
            None
        }
    }
}

/// What the lock file says once re-validated.
#[derive(Debug, Clone, PartialEq)]
pub enum LockFileVerdict {
    Missing,
    /// The recorded process is gone; the file has been removed.
    Stale { server_pid: u32 },
    /// The recorded process is alive but its port does not answer.
    Unresponsive(LockFileRecord),
    Live {
        record: LockFileRecord,
        health: HealthStatus,
    },
}

pub async fn inspect_lock_file(
    client: &Client,
    path: &Path,
    hostname: &str,
    timeout: Duration,
) -> LockFileVerdict {
    let Some(record) = read_lock_file(path) else {
        return LockFileVerdict::Missing;
    };

    if !process_alive(record.server_pid) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(
                "Removed stale lock file {} (pid {} is gone)",
                path.display(),
                record.server_pid
            ),
            Err(e) => warn!("Failed to remove stale lock file {}: {e}", path.display()),
        }
        return LockFileVerdict::Stale {
            server_pid: record.server_pid,
        };
    }

    let base_url = format!("http://{hostname}:{}", record.port);
    match probe_health(client, &base_url, timeout).await {
        Some(health) => LockFileVerdict::Live { record, health },
        None => LockFileVerdict::Unresponsive(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navrelay_protocol::ServiceState;

    fn health(state: ServiceState) -> HealthStatus {
        HealthStatus {
            status: "ok".into(),
            server: SERVER_IDENTITY.into(),
            server_pid: 1,
            clients: Vec::new(),
            port: 8010,
            state,
        }
    }

    #[test]
    fn terminating_backend_is_not_usable() {
        assert!(is_usable(&health(ServiceState::Serving)));
        assert!(is_usable(&health(ServiceState::IdleCountdown)));
        assert!(!is_usable(&health(ServiceState::Terminated)));
        assert!(!is_usable(&health(ServiceState::Initializing)));

        let foreign = HealthStatus {
            server: "some-other-server".into(),
            ..health(ServiceState::Serving)
        };
        assert!(!is_usable(&foreign));
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn garbage_lock_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("navrelay-server.lock");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_lock_file(&path).is_none());
        assert!(read_lock_file(&dir.path().join("missing.lock")).is_none());
    }

    #[tokio::test]
    async fn closed_port_has_no_backend() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = Client::new();
        let base_url = format!("http://127.0.0.1:{port}");
        assert!(probe_health(&client, &base_url, Duration::from_millis(500)).await.is_none());
    }
}
