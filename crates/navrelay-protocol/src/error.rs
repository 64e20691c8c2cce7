//! Wire error object and error codes.
//!
//! Codes below -32000 follow JSON-RPC 2.0; the relay range (-32010..) tags
//! the routing failures a caller of the shared server can observe.

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC 2.0 error codes plus relay errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorCode {
    // JSON-RPC 2.0 standard errors
    ParseError,
    InvalidRequest,
    InvalidParams,
    InternalError,

    // Relay errors
    ServerShuttingDown,
    ServerNotReady,
    NoClientAvailable,
    AmbiguousWorkspace,
    Timeout,
    ClientGone,
    ToolExecution,

    // Custom code
    Custom(i32),
}

impl RelayErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerShuttingDown => -32002,
            Self::ServerNotReady => -32003,
            Self::NoClientAvailable => -32010,
            Self::AmbiguousWorkspace => -32011,
            Self::Timeout => -32012,
            Self::ClientGone => -32013,
            Self::ToolExecution => -32014,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32002 => Self::ServerShuttingDown,
            -32003 => Self::ServerNotReady,
            -32010 => Self::NoClientAvailable,
            -32011 => Self::AmbiguousWorkspace,
            -32012 => Self::Timeout,
            -32013 => Self::ClientGone,
            -32014 => Self::ToolExecution,
            c => Self::Custom(c),
        }
    }
}

/// Error object returned by the public tool endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RelayError {
    pub fn new(code: RelayErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(RelayErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RelayErrorCode::InvalidRequest, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RelayErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RelayErrorCode::InternalError, message)
    }

    pub fn shutting_down() -> Self {
        Self::new(RelayErrorCode::ServerShuttingDown, "Server is shutting down")
    }

    pub fn not_ready() -> Self {
        Self::new(RelayErrorCode::ServerNotReady, "Server is still starting")
    }

    pub fn no_client_available() -> Self {
        Self::new(
            RelayErrorCode::NoClientAvailable,
            "No registered client is available to handle the call",
        )
    }

    pub fn error_code(&self) -> RelayErrorCode {
        RelayErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Relay Error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}
