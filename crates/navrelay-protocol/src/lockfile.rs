//! On-disk lock file record.
//!
//! The lock file is diagnostic only. Readers must confirm `serverPid` is a
//! live process and that the health endpoint answers before trusting it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ClientRegistration;
use crate::SERVER_IDENTITY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileRecord {
    pub server_pid: u32,
    pub port: u16,
    pub start_time: DateTime<Utc>,
    #[serde(default = "default_server_type")]
    pub server_type: String,
    #[serde(default)]
    pub is_detached: bool,
    #[serde(default, alias = "clientsSnapshot")]
    pub clients: Vec<ClientSnapshot>,
    pub last_update: DateTime<Utc>,
}

fn default_server_type() -> String {
    SERVER_IDENTITY.to_string()
}

impl LockFileRecord {
    pub fn new(server_pid: u32, port: u16, start_time: DateTime<Utc>) -> Self {
        Self {
            server_pid,
            port,
            start_time,
            server_type: SERVER_IDENTITY.to_string(),
            is_detached: true,
            clients: Vec::new(),
            last_update: start_time,
        }
    }

    /// Replace the clients snapshot and bump `lastUpdate`.
    pub fn refresh<'a>(&mut self, clients: impl IntoIterator<Item = &'a ClientRegistration>) {
        self.clients = clients.into_iter().map(ClientSnapshot::from).collect();
        self.last_update = Utc::now();
    }
}

/// A registration as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub client_id: String,
    pub workspace_name: String,
    pub workspace_path: String,
    pub pid: u32,
}

impl From<&ClientRegistration> for ClientSnapshot {
    fn from(reg: &ClientRegistration) -> Self {
        Self {
            client_id: reg.client_id.clone(),
            workspace_name: reg.workspace_name.clone(),
            workspace_path: reg.workspace_path.clone(),
            pid: reg.pid,
        }
    }
}
