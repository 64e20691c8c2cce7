//! Navrelay Transport Layer
//!
//! The backend side serves one WebSocket channel per host process at
//! `/ipc`, plus `/health`, `/clients`, and `POST /tools/call` over HTTP.
//! The host side is [`ChannelClient`]. Both ends correlate replies to
//! requests through [`PendingRequests`]; the channel itself carries no
//! correlation of its own.
//!
//! The transport is decoupled from the shared service via the
//! [`RelayHandler`] trait.

pub mod client;
pub mod error;
pub mod pending;
pub mod server;

pub use client::{ChannelClient, ChannelClientConfig, ChannelEvent};
pub use error::TransportError;
pub use pending::{PendingError, PendingReply, PendingRequests};
pub use server::{ChannelHandle, RelayHandler, TransportConfig, TransportServer, status_for};
