//! SharedService: the backend's registry, routing, dispatch, and lifecycle.
//!
//! Lifecycle: `Initializing → Serving ⇄ IdleCountdown → Terminated`.
//! The service counts down whenever its registry is empty, including right
//! after it starts serving. A registration during the countdown cancels it.
//! If the countdown elapses with the registry still empty, the service
//! terminates and removes its lock file.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use navrelay_protocol::{
    ChannelMessage, ClientList, ClientRegistration, HealthStatus, RelayError, SERVER_IDENTITY,
    ServiceState, ToolCallRequest, ToolCallResponse, ToolInvocation,
};
use navrelay_transport::{ChannelHandle, PendingError, PendingRequests, RelayHandler};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{CallError, RoutingFailure};
use crate::lockfile::LockFile;
use crate::registry::{ClientRegistry, RegisterOutcome};
use crate::routing::RoutingEngine;

type CallResult = Result<Value, CallError>;

#[derive(Default)]
struct IdleTimer {
    handle: Option<JoinHandle<()>>,
    /// Bumped on every arm/cancel so a timer that already woke up can tell
    /// it has been superseded.
    epoch: u64,
}

pub struct SharedService {
    config: ServiceConfig,
    registry: ClientRegistry,
    router: RoutingEngine,
    pending: PendingRequests<CallResult>,
    state: watch::Sender<ServiceState>,
    /// Serializes lifecycle transitions against registry changes.
    lifecycle: Mutex<IdleTimer>,
    lock_file: Mutex<Option<LockFile>>,
    port: AtomicU16,
    this: Weak<SharedService>,
}

impl SharedService {
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ServiceState::Initializing);
        Arc::new_cyclic(|this| Self {
            router: RoutingEngine::new(config.routing),
            config,
            registry: ClientRegistry::new(),
            pending: PendingRequests::new(),
            state,
            lifecycle: Mutex::new(IdleTimer::default()),
            lock_file: Mutex::new(None),
            port: AtomicU16::new(0),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Tool calls waiting for a client's answer.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// The endpoint is bound: write the lock file and start serving.
    pub fn begin_serving(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);

        if let Some(path) = &self.config.lock_file {
            let lock_file = LockFile::new(path.clone(), port);
            lock_file.refresh(&self.registry.snapshot());
            *self.lock_file.lock() = Some(lock_file);
        }

        let mut timer = self.lifecycle.lock();
        if self.state() != ServiceState::Initializing {
            return;
        }
        self.state.send_replace(ServiceState::Serving);
        info!(
            "Shared service serving on port {port} (pid {})",
            std::process::id()
        );
        if self.registry.is_empty() {
            self.arm_idle_timer(&mut timer);
        }
    }

    /// Resolves once the service has terminated.
    pub async fn terminated(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ServiceState::Terminated).await;
    }

    // ── Registry operations ─────────────────────────────────────────────

    pub fn register(
        &self,
        channel: &ChannelHandle,
        registration: ClientRegistration,
    ) -> Result<RegisterOutcome, CallError> {
        let client_id = registration.client_id.clone();
        let outcome = {
            let mut timer = self.lifecycle.lock();
            self.ensure_accepting()?;
            let outcome = self.registry.register(channel, registration);
            if self.state() == ServiceState::IdleCountdown {
                info!("Registration from {client_id} cancelled idle shutdown");
            }
            self.cancel_idle_timer(&mut timer);
            self.state.send_replace(ServiceState::Serving);
            outcome
        };

        if let RegisterOutcome::Replaced { previous } = &outcome {
            self.fail_calls_to(previous);
        }
        self.refresh_lock_file();
        Ok(outcome)
    }

    /// Remove a client. Unknown ids succeed.
    pub fn unregister(&self, client_id: &str) {
        let removed = self.registry.unregister(client_id);
        if removed.is_none() {
            debug!("Unregister for unknown client {client_id}");
        }
        self.after_removal(removed.as_ref());
    }

    /// Implicit unregister of whatever client the channel was bound to.
    pub fn channel_closed(&self, channel_id: &str) {
        let removed = self.registry.channel_closed(channel_id);
        self.after_removal(removed.as_ref());
    }

    fn after_removal(&self, removed: Option<&ClientRegistration>) {
        if let Some(reg) = removed {
            self.fail_calls_to(&reg.client_id);
            self.refresh_lock_file();
        }

        let mut timer = self.lifecycle.lock();
        if self.state() == ServiceState::Serving && self.registry.is_empty() {
            self.state.send_replace(ServiceState::IdleCountdown);
            self.arm_idle_timer(&mut timer);
        }
    }

    fn fail_calls_to(&self, client_id: &str) {
        let failed = self.pending.fail_where(
            |target| target == Some(client_id),
            |_| {
                Err(CallError::Routing(RoutingFailure::ClientGone {
                    client_id: client_id.to_string(),
                }))
            },
        );
        if failed > 0 {
            warn!("Failed {failed} in-flight call(s) to departed client {client_id}");
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Route a call to a client and wait for its answer.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> CallResult {
        self.ensure_accepting()?;

        let registrations = self.registry.snapshot();
        let route = self
            .router
            .route(&registrations, invocation.workspace_hint())?;
        let client_id = route.client_id().to_string();

        let channel = self.registry.channel_for(&client_id).ok_or_else(|| {
            RoutingFailure::ClientGone {
                client_id: client_id.clone(),
            }
        })?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut request =
            ToolCallRequest::new(request_id.clone(), invocation.tool_name, invocation.args);
        request.workspace_path = invocation.workspace_path;

        debug!(
            "Dispatching {} as {request_id} to {client_id} ({:?})",
            request.tool_name, route.reason
        );

        let reply = self
            .pending
            .register(request_id.clone(), Some(client_id.clone()));
        if channel.send(ChannelMessage::ToolCallRequest(request)).is_err() {
            return Err(RoutingFailure::ClientGone { client_id }.into());
        }

        match reply.wait(self.config.call_timeout).await {
            Ok(result) => result,
            Err(PendingError::TimedOut) => {
                warn!("Call {request_id} to {client_id} timed out");
                Err(RoutingFailure::Timeout {
                    client_id,
                    request_id,
                    timeout: self.config.call_timeout,
                }
                .into())
            }
            Err(PendingError::Abandoned) => Err(CallError::ShuttingDown),
        }
    }

    fn ensure_accepting(&self) -> Result<(), CallError> {
        match self.state() {
            ServiceState::Serving | ServiceState::IdleCountdown => Ok(()),
            ServiceState::Initializing => Err(CallError::NotReady),
            ServiceState::Terminated => Err(CallError::ShuttingDown),
        }
    }

    /// Only the client a call was routed to may answer it.
    fn complete_call(&self, channel_id: &str, response: ToolCallResponse) {
        let request_id = response.request_id.clone();
        let Some(client_id) = self.registry.client_for_channel(channel_id) else {
            warn!("Dropping response {request_id} from unregistered channel {channel_id}");
            return;
        };
        let outcome = response
            .into_outcome()
            .map_err(|message| CallError::ToolExecution {
                client_id: client_id.clone(),
                message,
            });
        if !self.pending.resolve_from(&request_id, &client_id, outcome) {
            debug!("Dropping late, unknown or misdirected response {request_id} from {client_id}");
        }
    }

    // ── Idle countdown ──────────────────────────────────────────────────

    fn arm_idle_timer(&self, timer: &mut IdleTimer) {
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.epoch += 1;
        let epoch = timer.epoch;
        let delay = self.config.idle_shutdown_delay;
        let this = self.this.clone();

        info!("No clients registered; shutting down in {delay:?} unless one registers");
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(service) = this.upgrade() {
                service.idle_elapsed(epoch);
            }
        }));
    }

    fn cancel_idle_timer(&self, timer: &mut IdleTimer) {
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.epoch += 1;
    }

    fn idle_elapsed(&self, epoch: u64) {
        {
            let mut timer = self.lifecycle.lock();
            if timer.epoch != epoch
                || self.state() != ServiceState::IdleCountdown
                || !self.registry.is_empty()
            {
                return;
            }
            timer.handle = None;
            self.state.send_replace(ServiceState::Terminated);
        }
        self.finish_termination("idle timeout");
    }

    // ── Termination ─────────────────────────────────────────────────────

    /// Stop accepting work, fail in-flight calls, and remove the lock file.
    /// Safe to call more than once.
    pub fn terminate(&self, reason: &str) {
        {
            let mut timer = self.lifecycle.lock();
            if self.state() == ServiceState::Terminated {
                return;
            }
            self.cancel_idle_timer(&mut timer);
            self.state.send_replace(ServiceState::Terminated);
        }
        self.finish_termination(reason);
    }

    fn finish_termination(&self, reason: &str) {
        let failed = self
            .pending
            .fail_where(|_| true, |_| Err(CallError::ShuttingDown));
        if failed > 0 {
            warn!("Failed {failed} in-flight call(s) on shutdown");
        }
        if let Some(lock_file) = self.lock_file.lock().take() {
            lock_file.remove();
        }
        info!("Shared service terminated ({reason})");
    }

    fn refresh_lock_file(&self) {
        if let Some(lock_file) = self.lock_file.lock().as_ref() {
            lock_file.refresh(&self.registry.snapshot());
        }
    }
}

impl RelayHandler for SharedService {
    async fn on_message(&self, channel: &ChannelHandle, message: ChannelMessage) {
        let reply = match message {
            ChannelMessage::RegisterClient {
                request_id,
                registration,
            } => match self.register(channel, registration) {
                Ok(_) => ChannelMessage::register_ok(request_id),
                Err(e) => ChannelMessage::register_failed(request_id, e.to_string()),
            },
            ChannelMessage::UnregisterClient {
                request_id,
                client_id,
            } => {
                self.unregister(&client_id);
                ChannelMessage::unregister_ok(request_id)
            }
            ChannelMessage::ToolCallResponse(response) => {
                self.complete_call(channel.id(), response);
                return;
            }
            other => {
                warn!(
                    "Ignoring {} frame on channel {}",
                    other.kind(),
                    channel.id()
                );
                return;
            }
        };

        if let Err(e) = channel.send(reply) {
            warn!("Failed to reply on channel {}: {e}", channel.id());
        }
    }

    async fn on_disconnect(&self, channel_id: &str) {
        self.channel_closed(channel_id);
    }

    async fn call_tool(&self, invocation: ToolInvocation) -> Result<Value, RelayError> {
        self.dispatch(invocation).await.map_err(RelayError::from)
    }

    fn health(&self) -> HealthStatus {
        let state = self.state();
        HealthStatus {
            status: (if state.is_accepting() { "ok" } else { "unavailable" }).into(),
            server: SERVER_IDENTITY.into(),
            server_pid: std::process::id(),
            clients: self.registry.summaries(),
            port: self.port(),
            state,
        }
    }

    fn clients(&self) -> ClientList {
        ClientList::new(self.registry.snapshot())
    }
}
