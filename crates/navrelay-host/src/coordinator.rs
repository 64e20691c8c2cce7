//! ServerCoordinator: makes sure exactly one backend serves this machine and
//! keeps the host's channel to it.
//!
//! Discovery order is health probe on the configured port, then the lock
//! file (re-validated), then a detached spawn. Concurrent callers share one
//! attempt. Once a backend is found the result is cached until
//! [`ServerCoordinator::invalidate`] is called. The cache is also dropped
//! when the channel to the backend has been lost, so the next call after a
//! backend crash re-runs discovery and may spawn a replacement.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use navrelay_protocol::{ChannelMessage, ClientRegistration};
use navrelay_transport::ChannelClient;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::discovery::{LockFileVerdict, inspect_lock_file, probe_health};
use crate::error::CoordinatorError;
use crate::spawn::{spawn_detached, wait_until_healthy};

/// Who started the backend this host is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    External,
    SelfSpawned,
}

type StartupFuture = Shared<BoxFuture<'static, Result<Ownership, String>>>;

enum Availability {
    Unknown,
    Starting(StartupFuture),
    Available(Ownership),
}

struct Inner {
    config: CoordinatorConfig,
    http: Client,
    availability: Mutex<Availability>,
    port: AtomicU16,
    channel: Mutex<Option<ChannelClient>>,
    registered: Mutex<BTreeSet<String>>,
}

#[derive(Clone)]
pub struct ServerCoordinator {
    inner: Arc<Inner>,
}

impl ServerCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let port = config.port;
        Self {
            inner: Arc::new(Inner {
                config,
                http: Client::new(),
                availability: Mutex::new(Availability::Unknown),
                port: AtomicU16::new(port),
                channel: Mutex::new(None),
                registered: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Port of the backend in use. This is the configured port unless the
    /// backend was found through the lock file.
    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::Relaxed)
    }

    /// `None` until a backend has been found.
    pub fn ownership(&self) -> Option<Ownership> {
        match &*self.inner.availability.lock() {
            Availability::Available(ownership) => Some(*ownership),
            _ => None,
        }
    }

    /// Client ids this coordinator has registered and not yet unregistered.
    pub fn registered_clients(&self) -> Vec<String> {
        self.inner.registered.lock().iter().cloned().collect()
    }

    /// Find or start a backend. Callers arriving while an attempt is in
    /// progress wait for that attempt; at most one spawn happens per attempt.
    pub async fn ensure_server_available(&self) -> Result<Ownership, CoordinatorError> {
        self.forget_lost_channel();

        let attempt = {
            let mut availability = self.inner.availability.lock();
            let in_flight = match &*availability {
                Availability::Available(ownership) => return Ok(*ownership),
                Availability::Starting(attempt) => Some(attempt.clone()),
                Availability::Unknown => None,
            };
            match in_flight {
                Some(attempt) => attempt,
                None => {
                    let attempt = discover_or_spawn(self.inner.clone()).boxed().shared();
                    *availability = Availability::Starting(attempt.clone());
                    attempt
                }
            }
        };

        attempt
            .await
            .map_err(|reason| CoordinatorError::StartupFailure { reason })
    }

    /// Forget the cached backend and drop the channel. The next call
    /// re-probes.
    pub fn invalidate(&self) {
        {
            let mut availability = self.inner.availability.lock();
            if !matches!(*availability, Availability::Starting(_)) {
                *availability = Availability::Unknown;
            }
        }
        if let Some(channel) = self.inner.channel.lock().take() {
            channel.disconnect();
        }
        debug!("Shared server availability invalidated");
    }

    /// A channel whose link dropped means the backend behind the cached
    /// mark may be gone.
    fn forget_lost_channel(&self) {
        let lost = self
            .inner
            .channel
            .lock()
            .as_ref()
            .is_some_and(ChannelClient::is_lost);
        if lost {
            info!("Channel to shared server was lost; rediscovering");
            self.invalidate();
        }
    }

    /// The connected channel, creating it if needed.
    pub async fn channel(&self) -> Result<ChannelClient, CoordinatorError> {
        self.ensure_server_available().await?;

        let channel = self
            .inner
            .channel
            .lock()
            .get_or_insert_with(|| {
                ChannelClient::new(self.inner.config.channel_config(self.port()))
            })
            .clone();

        if let Err(e) = channel.connect().await {
            warn!("Channel to shared server failed: {e}");
            self.invalidate();
            return Err(e.into());
        }
        Ok(channel)
    }

    /// Make sure a backend is up, then register `registration` with it.
    /// Returns the channel the backend will send tool calls on.
    pub async fn register_client(
        &self,
        registration: &ClientRegistration,
    ) -> Result<ChannelClient, CoordinatorError> {
        let client_id = registration.client_id.clone();
        let channel = match self.channel().await {
            Ok(channel) => channel,
            // The cached backend went away; `channel` invalidated it, so the
            // second try re-runs discovery.
            Err(CoordinatorError::Transport(e)) if e.is_connection_failure() => {
                debug!("Retrying registration of {client_id} after: {e}");
                self.channel()
                    .await
                    .map_err(|e| registration_failure(&client_id, e))?
            }
            Err(e) => return Err(registration_failure(&client_id, e)),
        };

        let message = ChannelMessage::RegisterClient {
            request_id: Uuid::new_v4().to_string(),
            registration: registration.clone(),
        };

        match channel.request(message, self.inner.config.register_timeout).await {
            Ok(ChannelMessage::RegisterResponse { success: true, .. }) => {
                info!(
                    "Registered {client_id} for {} with shared server on port {}",
                    registration.workspace_path,
                    self.port()
                );
                self.inner.registered.lock().insert(client_id);
                Ok(channel)
            }
            Ok(ChannelMessage::RegisterResponse { error, .. }) => {
                Err(CoordinatorError::RegistrationFailure {
                    client_id,
                    reason: error.unwrap_or_else(|| "rejected by shared server".into()),
                })
            }
            Ok(other) => Err(CoordinatorError::RegistrationFailure {
                client_id,
                reason: format!("unexpected {} reply", other.kind()),
            }),
            Err(e) => {
                self.invalidate();
                Err(CoordinatorError::RegistrationFailure {
                    client_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Withdraw a client. Never stops the backend, even one this host
    /// spawned; the backend's idle countdown decides that.
    pub async fn unregister_client(&self, client_id: &str) -> Result<(), CoordinatorError> {
        self.inner.registered.lock().remove(client_id);

        let Some(channel) = self.inner.channel.lock().clone() else {
            debug!("No channel open; nothing to unregister for {client_id}");
            return Ok(());
        };
        if !channel.is_connected() {
            return Ok(());
        }

        let message = ChannelMessage::UnregisterClient {
            request_id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
        };
        match channel.request(message, self.inner.config.unregister_timeout).await {
            Ok(_) => {
                info!("Unregistered {client_id}");
                Ok(())
            }
            Err(e) => {
                warn!("Unregister of {client_id} failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Unregister everything this coordinator registered and close the
    /// channel.
    pub async fn shutdown(&self) {
        for client_id in self.registered_clients() {
            let _ = self.unregister_client(&client_id).await;
        }
        if let Some(channel) = self.inner.channel.lock().take() {
            channel.disconnect();
        }
    }
}

/// Startup failures keep their own kind; anything else becomes a
/// registration failure for `client_id`.
fn registration_failure(client_id: &str, err: CoordinatorError) -> CoordinatorError {
    match err {
        CoordinatorError::Transport(e) => CoordinatorError::RegistrationFailure {
            client_id: client_id.to_string(),
            reason: e.to_string(),
        },
        other => other,
    }
}

async fn discover_or_spawn(inner: Arc<Inner>) -> Result<Ownership, String> {
    let result = locate(&inner).await;
    *inner.availability.lock() = match &result {
        Ok(ownership) => Availability::Available(*ownership),
        Err(_) => Availability::Unknown,
    };
    result
}

async fn locate(inner: &Inner) -> Result<Ownership, String> {
    let config = &inner.config;

    let base_url = config.base_url(config.port);
    if let Some(health) = probe_health(&inner.http, &base_url, config.probe_timeout).await {
        info!(
            "Using shared server on port {} (pid {}, {} clients)",
            config.port,
            health.server_pid,
            health.clients.len()
        );
        inner.port.store(config.port, Ordering::Relaxed);
        return Ok(Ownership::External);
    }

    match inspect_lock_file(&inner.http, &config.lock_file, &config.hostname, config.probe_timeout).await {
        LockFileVerdict::Live { record, health } => {
            info!(
                "Using shared server from lock file on port {} (pid {})",
                record.port, health.server_pid
            );
            inner.port.store(record.port, Ordering::Relaxed);
            return Ok(Ownership::External);
        }
        LockFileVerdict::Stale { server_pid } => {
            debug!("Lock file named dead pid {server_pid}");
        }
        LockFileVerdict::Unresponsive(record) => {
            warn!(
                "Lock file names live pid {} but port {} does not answer",
                record.server_pid, record.port
            );
        }
        LockFileVerdict::Missing => {}
    }

    let command = config
        .resolve_server_command()
        .map_err(|e| format!("cannot resolve server command: {e}"))?;
    let pid = spawn_detached(&command).map_err(|e| format!("failed to launch `{command}`: {e}"))?;

    let health = wait_until_healthy(
        &inner.http,
        &base_url,
        config.probe_timeout,
        config.poll_interval,
        config.startup_timeout,
    )
    .await
    .ok_or_else(|| {
        format!(
            "`{command}` (pid {pid}) did not answer on port {} within {:?}",
            config.port, config.startup_timeout
        )
    })?;

    inner.port.store(config.port, Ordering::Relaxed);
    if health.server_pid == pid {
        info!("Shared server started by this host (pid {pid})");
        Ok(Ownership::SelfSpawned)
    } else {
        // Another host won the race for the port.
        info!("Shared server on port {} belongs to pid {}", config.port, health.server_pid);
        Ok(Ownership::External)
    }
}
