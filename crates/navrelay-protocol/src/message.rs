//! Channel frames exchanged between a host process and the shared server.
//!
//! Every frame is a JSON object tagged by `type`. The channel itself does not
//! correlate anything: each exchange carries its own `requestId`, and the
//! sender keeps a one-shot handler keyed by it until the reply arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::kinds::{MessageKind, MessageKinds};

/// Args key a caller may use to name the workspace a tool call targets.
pub const WORKSPACE_HINT_ARG: &str = "workspace_path";

/// One host process's claim to serve a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    /// Absolute workspace path; the routing key.
    pub workspace_path: String,
    /// Display name only.
    pub workspace_name: String,
    /// Unique per host-process instance.
    pub client_id: String,
    /// Host OS process id.
    pub pid: u32,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
}

impl ClientRegistration {
    pub fn new(
        workspace_path: impl Into<String>,
        workspace_name: impl Into<String>,
        client_id: impl Into<String>,
        pid: u32,
    ) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            workspace_name: workspace_name.into(),
            client_id: client_id.into(),
            pid,
            registered_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            client_id: self.client_id.clone(),
            workspace_name: self.workspace_name.clone(),
            workspace_path: self.workspace_path.clone(),
        }
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.client_id.trim().is_empty() {
            return Err(RelayError::invalid_params("registration is missing clientId"));
        }
        if self.workspace_path.trim().is_empty() {
            return Err(RelayError::invalid_params(
                "registration is missing workspacePath",
            ));
        }
        Ok(())
    }
}

/// The display subset of a registration used by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub client_id: String,
    pub workspace_name: String,
    pub workspace_path: String,
}

/// A tool call forwarded to the host that owns the target workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

impl ToolCallRequest {
    pub fn new(request_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            request_id: request_id.into(),
            tool_name: tool_name.into(),
            args,
            workspace_path: None,
        }
    }

    pub fn with_workspace(mut self, workspace_path: impl Into<String>) -> Self {
        self.workspace_path = Some(workspace_path.into());
        self
    }

    /// The workspace this call should be routed to, if the caller named one.
    ///
    /// An explicit `workspacePath` wins over a `workspace_path` key in args.
    /// Blank strings count as absent.
    pub fn workspace_hint(&self) -> Option<&str> {
        let explicit = self
            .workspace_path
            .as_deref()
            .filter(|p| !p.trim().is_empty());
        explicit.or_else(|| {
            self.args
                .get(WORKSPACE_HINT_ARG)
                .and_then(Value::as_str)
                .filter(|p| !p.trim().is_empty())
        })
    }
}

/// Reply to a [`ToolCallRequest`]; carries either `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResponse {
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// A missing result with no error is a successful `null`.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Every frame that can travel over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ChannelMessage {
    RegisterClient {
        request_id: String,
        registration: ClientRegistration,
    },
    RegisterResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    UnregisterClient {
        request_id: String,
        client_id: String,
    },
    UnregisterResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolCallRequest(ToolCallRequest),
    ToolCallResponse(ToolCallResponse),
}

impl ChannelMessage {
    pub fn register_ok(request_id: impl Into<String>) -> Self {
        Self::RegisterResponse {
            request_id: request_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn register_failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::RegisterResponse {
            request_id: request_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn unregister_ok(request_id: impl Into<String>) -> Self {
        Self::UnregisterResponse {
            request_id: request_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RegisterClient { .. } => MessageKinds::REGISTER_CLIENT,
            Self::RegisterResponse { .. } => MessageKinds::REGISTER_RESPONSE,
            Self::UnregisterClient { .. } => MessageKinds::UNREGISTER_CLIENT,
            Self::UnregisterResponse { .. } => MessageKinds::UNREGISTER_RESPONSE,
            Self::ToolCallRequest(_) => MessageKinds::TOOL_CALL_REQUEST,
            Self::ToolCallResponse(_) => MessageKinds::TOOL_CALL_RESPONSE,
        }
    }

    /// The id linking this frame to the other half of its exchange.
    pub fn request_id(&self) -> &str {
        match self {
            Self::RegisterClient { request_id, .. }
            | Self::RegisterResponse { request_id, .. }
            | Self::UnregisterClient { request_id, .. }
            | Self::UnregisterResponse { request_id, .. } => request_id,
            Self::ToolCallRequest(req) => &req.request_id,
            Self::ToolCallResponse(resp) => &resp.request_id,
        }
    }

    /// Responses complete an exchange started by the other side.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::RegisterResponse { .. }
                | Self::UnregisterResponse { .. }
                | Self::ToolCallResponse(_)
        )
    }

    /// Check the per-kind schema beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.request_id().trim().is_empty() {
            return Err(RelayError::invalid_request(format!(
                "{} frame is missing requestId",
                self.kind()
            )));
        }

        match self {
            Self::RegisterClient { registration, .. } => registration.validate(),
            Self::UnregisterClient { client_id, .. } if client_id.trim().is_empty() => Err(
                RelayError::invalid_params("unregister-client is missing clientId"),
            ),
            Self::RegisterResponse { success: false, error: None, .. }
            | Self::UnregisterResponse { success: false, error: None, .. } => Err(
                RelayError::invalid_params(format!("failed {} carries no error", self.kind())),
            ),
            Self::ToolCallRequest(req) => {
                if req.tool_name.trim().is_empty() {
                    return Err(RelayError::invalid_params("tool-call-request is missing toolName"));
                }
                if !(req.args.is_object() || req.args.is_null()) {
                    return Err(RelayError::invalid_params("tool-call-request args must be an object"));
                }
                Ok(())
            }
            Self::ToolCallResponse(resp) if resp.result.is_some() && resp.error.is_some() => Err(
                RelayError::invalid_params("tool-call-response carries both result and error"),
            ),
            _ => Ok(()),
        }
    }

    /// Parse and validate a text frame.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let message: Self = serde_json::from_str(text)
            .map_err(|e| RelayError::parse_error(format!("Invalid channel frame: {e}")))?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
