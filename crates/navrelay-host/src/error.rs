use navrelay_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No healthy backend could be found or started. Retry by calling
    /// `ensure_server_available` again.
    #[error("no shared server available: {reason}")]
    StartupFailure { reason: String },

    /// The backend rejected the registration or did not answer in time.
    #[error("registration of {client_id} failed: {reason}")]
    RegistrationFailure { client_id: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
