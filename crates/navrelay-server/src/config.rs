use std::path::PathBuf;
use std::time::Duration;

use navrelay_transport::TransportConfig;

use crate::routing::RoutingPolicy;

/// Shared service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub hostname: String,
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// How long the registry must stay empty before the service exits
    pub idle_shutdown_delay: Duration,
    /// Deadline for a routed tool call to be answered
    pub call_timeout: Duration,
    /// Diagnostic lock file; `None` disables it
    pub lock_file: Option<PathBuf>,
    pub routing: RoutingPolicy,
    pub max_connections: Option<usize>,
    pub enable_cors: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            hostname: navrelay_protocol::DEFAULT_HOSTNAME.into(),
            port: navrelay_protocol::DEFAULT_PORT,
            idle_shutdown_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            lock_file: Some(navrelay_protocol::default_lock_file_path()),
            routing: RoutingPolicy::default(),
            max_connections: Some(256),
            enable_cors: false,
        }
    }
}

impl ServiceConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            port: self.port,
            hostname: self.hostname.clone(),
            enable_cors: self.enable_cors,
            max_connections: self.max_connections,
        }
    }
}
