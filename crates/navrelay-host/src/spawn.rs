//! Detached backend launch and readiness polling.
//!
//! The launched process is not supervised: it outlives this one, and its
//! liveness is judged only by health probes.

use std::process::Stdio;
use std::time::Duration;

use navrelay_protocol::HealthStatus;
use reqwest::Client;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ServerCommand;
use crate::discovery::probe_health;

/// Launch `command` detached from this process. Returns its pid.
pub fn spawn_detached(command: &ServerCommand) -> std::io::Result<u32> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(false);

    // Own process group: a ctrl-c aimed at the host does not reach it.
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();
    info!("Launched shared server: {command} (pid {pid})");

    // Dropping the handle leaves the process running.
    drop(child);
    Ok(pid)
}

/// Probe every `poll_interval` until the backend answers or `startup_timeout`
/// passes.
pub async fn wait_until_healthy(
    client: &Client,
    base_url: &str,
    probe_timeout: Duration,
    poll_interval: Duration,
    startup_timeout: Duration,
) -> Option<HealthStatus> {
    let poll = async {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(health) = probe_health(client, base_url, probe_timeout).await {
                return health;
            }
            debug!("Shared server at {base_url} not ready yet");
        }
    };

    tokio::time::timeout(startup_timeout, poll).await.ok()
}
