//! Navrelay - Protocol Types
//!
//! Wire types shared by the backend and every host process: channel
//! message kinds, registration records, tool-call frames, diagnostics
//! payloads, the lock-file record, and error codes.

use std::path::PathBuf;

pub mod error;
pub mod kinds;
pub mod lockfile;
pub mod message;
pub mod status;

pub use error::{RelayError, RelayErrorCode};
pub use kinds::{MessageKind, MessageKinds};
pub use lockfile::{ClientSnapshot, LockFileRecord};
pub use message::{
    ChannelMessage, ClientRegistration, ClientSummary, ToolCallRequest, ToolCallResponse,
    WORKSPACE_HINT_ARG,
};
pub use status::{ClientList, HealthStatus, ServiceState, ToolCallReply, ToolInvocation};

/// Port the backend listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8010;
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

/// Identity reported by `/health` and written to the lock file.
pub const SERVER_IDENTITY: &str = "shared-navrelay-server";
pub const LOCK_FILE_NAME: &str = "navrelay-server.lock";

// Endpoint paths
pub const IPC_PATH: &str = "/ipc";
pub const HEALTH_PATH: &str = "/health";
pub const CLIENTS_PATH: &str = "/clients";
pub const TOOL_CALL_PATH: &str = "/tools/call";

/// `<tmp>/navrelay-server.lock`
pub fn default_lock_file_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE_NAME)
}
