//! Diagnostics payloads and the public tool-invocation body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::message::{ClientRegistration, ClientSummary, WORKSPACE_HINT_ARG};

/// Lifecycle state of the shared service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Initializing,
    Serving,
    IdleCountdown,
    Terminated,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Serving => "serving",
            Self::IdleCountdown => "idle-countdown",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the service still takes registrations and calls.
    pub fn is_accepting(&self) -> bool {
        matches!(self, Self::Serving | Self::IdleCountdown)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub server: String,
    pub server_pid: u32,
    pub clients: Vec<ClientSummary>,
    pub port: u16,
    pub state: ServiceState,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Body of `GET /clients`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientList {
    pub clients: Vec<ClientRegistration>,
    pub total_clients: usize,
}

impl ClientList {
    pub fn new(clients: Vec<ClientRegistration>) -> Self {
        let total_clients = clients.len();
        Self {
            clients,
            total_clients,
        }
    }
}

/// Body of `POST /tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            workspace_path: None,
        }
    }

    pub fn with_workspace(mut self, workspace_path: impl Into<String>) -> Self {
        self.workspace_path = Some(workspace_path.into());
        self
    }

    /// Same precedence as [`crate::ToolCallRequest::workspace_hint`].
    pub fn workspace_hint(&self) -> Option<&str> {
        self.workspace_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| {
                self.args
                    .get(WORKSPACE_HINT_ARG)
                    .and_then(Value::as_str)
                    .filter(|p| !p.trim().is_empty())
            })
    }
}

/// Response body of `POST /tools/call`: exactly one of the two is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RelayError>,
}

impl ToolCallReply {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: RelayError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RelayError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
