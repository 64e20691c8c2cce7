use std::time::Duration;

use navrelay_protocol::{RelayError, RelayErrorCode};
use navrelay_transport::TransportError;
use serde_json::json;
use thiserror::Error;

/// Why a call could not be delivered to, or answered by, a client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingFailure {
    #[error("no client is registered")]
    NoClientAvailable,

    #[error("no registered client serves workspace {workspace}")]
    NoMatchingClient { workspace: String },

    #[error("workspace {workspace} matches several clients: {}", candidates.join(", "))]
    Ambiguous {
        workspace: String,
        candidates: Vec<String>,
    },

    #[error("client {client_id} did not answer {request_id} within {timeout:?}")]
    Timeout {
        client_id: String,
        request_id: String,
        timeout: Duration,
    },

    #[error("client {client_id} went away before answering")]
    ClientGone { client_id: String },
}

/// Failure of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error(transparent)]
    Routing(#[from] RoutingFailure),

    /// The client's own failure, passed through verbatim.
    #[error("{message}")]
    ToolExecution { client_id: String, message: String },

    #[error("server is shutting down")]
    ShuttingDown,

    /// The endpoint is bound but the service has not started serving.
    #[error("server is still starting")]
    NotReady,
}

impl CallError {
    pub fn to_relay_error(&self) -> RelayError {
        let message = self.to_string();
        match self {
            Self::Routing(RoutingFailure::NoClientAvailable)
            | Self::Routing(RoutingFailure::NoMatchingClient { .. }) => {
                RelayError::new(RelayErrorCode::NoClientAvailable, message)
            }
            Self::Routing(RoutingFailure::Ambiguous { candidates, .. }) => {
                RelayError::new(RelayErrorCode::AmbiguousWorkspace, message)
                    .with_data(json!({ "candidates": candidates }))
            }
            Self::Routing(RoutingFailure::Timeout { client_id, .. }) => {
                RelayError::new(RelayErrorCode::Timeout, message)
                    .with_data(json!({ "clientId": client_id }))
            }
            Self::Routing(RoutingFailure::ClientGone { client_id }) => {
                RelayError::new(RelayErrorCode::ClientGone, message)
                    .with_data(json!({ "clientId": client_id }))
            }
            Self::ToolExecution { client_id, .. } => {
                RelayError::new(RelayErrorCode::ToolExecution, message)
                    .with_data(json!({ "clientId": client_id }))
            }
            Self::ShuttingDown => RelayError::shutting_down(),
            Self::NotReady => RelayError::not_ready(),
        }
    }
}

impl From<CallError> for RelayError {
    fn from(err: CallError) -> Self {
        err.to_relay_error()
    }
}

/// Failure to bring the shared service up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Another process owns the port. Not a failure of the caller's intent:
    /// the existing owner keeps serving.
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
