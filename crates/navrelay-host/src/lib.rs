//! Navrelay Host: the editor-host side.
//!
//! [`ServerCoordinator`] finds or starts the shared backend and registers
//! clients with it; [`HostSession`] keeps a client registered and answers
//! the tool calls routed to it.

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod host;
pub mod spawn;

pub use config::{CoordinatorConfig, ServerCommand};
pub use coordinator::{Ownership, ServerCoordinator};
pub use discovery::{LockFileVerdict, inspect_lock_file, is_usable, probe_health, process_alive};
pub use error::CoordinatorError;
pub use host::{EchoExecutor, HostSession, ToolExecutor};
