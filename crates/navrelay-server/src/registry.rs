//! ClientRegistry: live registrations and the channel bound to each.
//!
//! Registrations are kept in registration order; routing relies on it.
//! Every channel entry belongs to a registration, and a registration has at
//! most one channel. A single lock covers both maps so the two can never be
//! observed out of step.

use std::collections::HashMap;

use navrelay_protocol::{ClientRegistration, ClientSummary};
use navrelay_transport::ChannelHandle;
use parking_lot::RwLock;
use tracing::{debug, info};

/// What a registration did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    /// Same client id registered again; its position is kept.
    Refreshed,
    /// The channel was bound to a different client id, which was dropped.
    Replaced { previous: String },
}

#[derive(Default)]
struct Tables {
    registrations: Vec<ClientRegistration>,
    /// client id → channel
    channels: HashMap<String, ChannelHandle>,
    /// channel id → client id
    bindings: HashMap<String, String>,
}

impl Tables {
    fn position(&self, client_id: &str) -> Option<usize> {
        self.registrations
            .iter()
            .position(|reg| reg.client_id == client_id)
    }

    fn remove_client(&mut self, client_id: &str) -> Option<ClientRegistration> {
        let index = self.position(client_id)?;
        let removed = self.registrations.remove(index);
        if let Some(channel) = self.channels.remove(client_id) {
            self.bindings.remove(channel.id());
        }
        Some(removed)
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    tables: RwLock<Tables>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `registration` as served over `channel`.
    pub fn register(
        &self,
        channel: &ChannelHandle,
        registration: ClientRegistration,
    ) -> RegisterOutcome {
        let mut tables = self.tables.write();
        let client_id = registration.client_id.clone();

        // The channel already speaks for another client: that one is replaced.
        let previous = tables
            .bindings
            .get(channel.id())
            .filter(|bound| **bound != client_id)
            .cloned();
        if let Some(previous) = &previous {
            tables.remove_client(previous);
        }

        let refreshed = match tables.position(&client_id) {
            Some(index) => {
                tables.registrations[index] = registration;
                true
            }
            None => {
                tables.registrations.push(registration);
                false
            }
        };

        // The client may be re-registering over a new channel.
        if let Some(old) = tables.channels.insert(client_id.clone(), channel.clone()) {
            if old.id() != channel.id() {
                tables.bindings.remove(old.id());
                debug!("Client {client_id} moved to channel {}", channel.id());
            }
        }
        tables
            .bindings
            .insert(channel.id().to_string(), client_id.clone());

        let outcome = match previous {
            Some(previous) => RegisterOutcome::Replaced { previous },
            None if refreshed => RegisterOutcome::Refreshed,
            None => RegisterOutcome::Added,
        };
        info!(
            "Client registered: {client_id} ({:?}, total: {})",
            outcome,
            tables.registrations.len()
        );
        outcome
    }

    /// Remove a client. Unknown ids are not an error.
    pub fn unregister(&self, client_id: &str) -> Option<ClientRegistration> {
        let mut tables = self.tables.write();
        let removed = tables.remove_client(client_id);
        if removed.is_some() {
            info!(
                "Client unregistered: {client_id} (total: {})",
                tables.registrations.len()
            );
        }
        removed
    }

    /// A channel closed: drop whichever client it was bound to.
    pub fn channel_closed(&self, channel_id: &str) -> Option<ClientRegistration> {
        let mut tables = self.tables.write();
        let client_id = tables.bindings.remove(channel_id)?;
        let removed = tables.remove_client(&client_id);
        if removed.is_some() {
            info!(
                "Client {client_id} dropped with its channel (total: {})",
                tables.registrations.len()
            );
        }
        removed
    }

    pub fn channel_for(&self, client_id: &str) -> Option<ChannelHandle> {
        self.tables.read().channels.get(client_id).cloned()
    }

    pub fn client_for_channel(&self, channel_id: &str) -> Option<String> {
        self.tables.read().bindings.get(channel_id).cloned()
    }

    pub fn get(&self, client_id: &str) -> Option<ClientRegistration> {
        let tables = self.tables.read();
        tables
            .position(client_id)
            .map(|index| tables.registrations[index].clone())
    }

    /// All registrations, oldest first.
    pub fn snapshot(&self) -> Vec<ClientRegistration> {
        self.tables.read().registrations.clone()
    }

    pub fn summaries(&self) -> Vec<ClientSummary> {
        self.tables
            .read()
            .registrations
            .iter()
            .map(ClientRegistration::summary)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().registrations.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.tables.read().channels.len()
    }

    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.registrations.clear();
        tables.channels.clear();
        tables.bindings.clear();
    }
}
