//! Navrelay Server: the shared backend.
//!
//! One process owns the public endpoint, the registry of host clients, and
//! the idle-shutdown policy. [`SharedServer`] binds the transport and drives
//! the [`SharedService`] lifecycle; the service itself is the
//! [`navrelay_transport::RelayHandler`] the transport calls into.

pub mod config;
pub mod error;
pub mod lockfile;
pub mod registry;
pub mod routing;
pub mod service;

use std::sync::Arc;

use navrelay_transport::{TransportError, TransportServer};
use tracing::info;

pub use config::ServiceConfig;
pub use error::{CallError, RoutingFailure, ServerError};
pub use lockfile::LockFile;
pub use registry::{ClientRegistry, RegisterOutcome};
pub use routing::{FuzzyMatch, Route, RouteReason, RoutingEngine, RoutingPolicy};
pub use service::SharedService;

/// A bound, serving backend.
pub struct SharedServer {
    service: Arc<SharedService>,
    transport: TransportServer,
}

impl SharedServer {
    /// Bind the endpoint and enter `Serving`.
    ///
    /// If the port is taken, returns [`ServerError::PortInUse`] without
    /// touching the lock file or anything else the current owner uses.
    pub async fn start(config: ServiceConfig) -> Result<Self, ServerError> {
        let port = config.port;
        let service = SharedService::new(config);

        let transport = match TransportServer::start(service.config().transport(), service.clone()).await {
            Ok(transport) => transport,
            Err(TransportError::AddrInUse { .. }) => return Err(ServerError::PortInUse { port }),
            Err(e) => return Err(e.into()),
        };

        service.begin_serving(transport.port());
        Ok(Self { service, transport })
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn service(&self) -> &Arc<SharedService> {
        &self.service
    }

    /// Serve until the idle countdown ends the service or the process is
    /// asked to stop, then close the endpoint.
    pub async fn run(mut self) {
        tokio::select! {
            _ = self.service.terminated() => {}
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                self.service.terminate("signal");
            }
        }
        self.transport.stop().await;
    }

    /// Terminate now and close the endpoint.
    pub async fn shutdown(mut self) {
        self.service.terminate("shutdown requested");
        self.transport.stop().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
