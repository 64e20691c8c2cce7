//! Host side of a tool call: receive requests from the backend, run them,
//! send the reply back.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use navrelay_protocol::{ChannelMessage, ClientRegistration, ToolCallRequest, ToolCallResponse};
use navrelay_transport::{ChannelClient, ChannelEvent};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::ServerCoordinator;
use crate::error::CoordinatorError;

/// Runs tools inside the editor host. An `Err` is reported to the caller as
/// a tool execution failure carrying the message verbatim.
pub trait ToolExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        tool_name: &str,
        args: Value,
    ) -> impl Future<Output = Result<Value, String>> + Send;
}

/// Answers every call with its own identity and the call it received. An
/// `"error"` string argument is returned as a failure instead.
#[derive(Debug, Clone)]
pub struct EchoExecutor {
    pub client_id: String,
    pub workspace_path: String,
}

impl EchoExecutor {
    pub fn for_registration(registration: &ClientRegistration) -> Self {
        Self {
            client_id: registration.client_id.clone(),
            workspace_path: registration.workspace_path.clone(),
        }
    }
}

impl ToolExecutor for EchoExecutor {
    async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, String> {
        if let Some(error) = args.get("error").and_then(Value::as_str) {
            return Err(error.to_string());
        }
        Ok(json!({
            "clientId": self.client_id,
            "workspacePath": self.workspace_path,
            "tool": tool_name,
            "args": args,
        }))
    }
}

/// One registered host client and the task serving its tool calls.
///
/// If the backend goes away the session invalidates the coordinator and
/// re-registers, which starts a new backend when none is left. Use one
/// session per coordinator.
pub struct HostSession {
    client_id: String,
    coordinator: ServerCoordinator,
    stopping: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HostSession {
    pub async fn start<E: ToolExecutor>(
        coordinator: ServerCoordinator,
        registration: ClientRegistration,
        executor: E,
    ) -> Result<Self, CoordinatorError> {
        let channel = coordinator.register_client(&registration).await?;
        let events = channel
            .events()
            .ok_or_else(|| CoordinatorError::RegistrationFailure {
                client_id: registration.client_id.clone(),
                reason: "channel is already attached to another session".into(),
            })?;

        let stopping = Arc::new(AtomicBool::new(false));
        let client_id = registration.client_id.clone();
        let task = tokio::spawn(serve(
            coordinator.clone(),
            registration,
            Arc::new(executor),
            channel,
            events,
            stopping.clone(),
        ));

        Ok(Self {
            client_id,
            coordinator,
            stopping,
            task,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn coordinator(&self) -> &ServerCoordinator {
        &self.coordinator
    }

    /// Unregister and stop serving. The backend keeps running.
    pub async fn stop(self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.task.abort();
        if let Err(e) = self.coordinator.unregister_client(&self.client_id).await {
            debug!("Unregister on stop failed: {e}");
        }
    }
}

async fn serve<E: ToolExecutor>(
    coordinator: ServerCoordinator,
    registration: ClientRegistration,
    executor: Arc<E>,
    mut channel: ChannelClient,
    mut events: UnboundedReceiver<ChannelEvent>,
    stopping: Arc<AtomicBool>,
) {
    loop {
        match events.recv().await {
            Some(ChannelEvent::ToolCall(request)) => {
                let channel = channel.clone();
                let executor = executor.clone();
                tokio::spawn(async move { answer(&channel, executor.as_ref(), request).await });
            }
            Some(ChannelEvent::Disconnected) | None => {
                if stopping.load(Ordering::SeqCst) {
                    return;
                }
                warn!(
                    "Lost shared server; re-registering {}",
                    registration.client_id
                );
                coordinator.invalidate();

                let Some((next_channel, next_events)) =
                    reattach(&coordinator, &registration, &stopping).await
                else {
                    return;
                };
                channel = next_channel;
                if let Some(next_events) = next_events {
                    events = next_events;
                }
            }
        }
    }
}

async fn reattach(
    coordinator: &ServerCoordinator,
    registration: &ClientRegistration,
    stopping: &AtomicBool,
) -> Option<(ChannelClient, Option<UnboundedReceiver<ChannelEvent>>)> {
    let delay = coordinator.config().reregister_delay;
    loop {
        tokio::time::sleep(delay).await;
        if stopping.load(Ordering::SeqCst) {
            return None;
        }
        match coordinator.register_client(registration).await {
            Ok(channel) => {
                info!("Re-registered {}", registration.client_id);
                let events = channel.events();
                return Some((channel, events));
            }
            Err(e) => warn!("Re-registration of {} failed: {e}", registration.client_id),
        }
    }
}

async fn answer<E: ToolExecutor>(channel: &ChannelClient, executor: &E, request: ToolCallRequest) {
    let ToolCallRequest {
        request_id,
        tool_name,
        args,
        ..
    } = request;
    debug!("Executing {tool_name} ({request_id})");

    let response = match executor.execute(&tool_name, args).await {
        Ok(result) => ToolCallResponse::success(request_id, result),
        Err(error) => ToolCallResponse::failure(request_id, error),
    };

    if let Err(e) = channel.send(&ChannelMessage::ToolCallResponse(response)) {
        warn!("Dropping reply to {tool_name}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> EchoExecutor {
        EchoExecutor {
            client_id: "c1".into(),
            workspace_path: "/repo/a".into(),
        }
    }

    #[tokio::test]
    async fn echo_reports_identity() {
        let result = echo()
            .execute("goto_definition", json!({"symbol": "main"}))
            .await
            .unwrap();
        assert_eq!(result["clientId"], "c1");
        assert_eq!(result["workspacePath"], "/repo/a");
        assert_eq!(result["tool"], "goto_definition");
        assert_eq!(result["args"]["symbol"], "main");
    }

    #[tokio::test]
    async fn echo_error_argument_fails() {
        let err = echo()
            .execute("find_references", json!({"error": "index not ready"}))
            .await
            .unwrap_err();
        assert_eq!(err, "index not ready");
    }
}
