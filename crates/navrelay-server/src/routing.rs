//! Picks the registered client that should execute a call.
//!
//! Order of preference for a call naming a workspace:
//! exact path match, then a bidirectional substring match, then (when
//! allowed) the default client. A call naming no workspace goes to the
//! default client, which is the oldest surviving registration.

use navrelay_protocol::ClientRegistration;
use tracing::{debug, warn};

use crate::error::RoutingFailure;

/// How loosely a workspace hint may match a registered path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FuzzyMatch {
    /// Exact matches only.
    Disabled,
    /// First substring hit in registration order.
    #[default]
    FirstMatch,
    /// Substring hits must be unique.
    RejectAmbiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub fuzzy: FuzzyMatch,
    /// Send calls whose hint matches nothing to the default client.
    pub fallback_to_default: bool,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            fuzzy: FuzzyMatch::FirstMatch,
            fallback_to_default: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Exact,
    Substring,
    /// No hint was given.
    Default,
    /// A hint was given but matched nothing.
    Fallback,
}

#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub registration: &'a ClientRegistration,
    pub reason: RouteReason,
}

impl Route<'_> {
    pub fn client_id(&self) -> &str {
        &self.registration.client_id
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingEngine {
    policy: RoutingPolicy,
}

impl RoutingEngine {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// `registrations` must be in registration order.
    pub fn route<'a>(
        &self,
        registrations: &'a [ClientRegistration],
        workspace: Option<&str>,
    ) -> Result<Route<'a>, RoutingFailure> {
        let Some(default) = registrations.first() else {
            return Err(RoutingFailure::NoClientAvailable);
        };

        let Some(workspace) = workspace else {
            return Ok(Route {
                registration: default,
                reason: RouteReason::Default,
            });
        };

        if let Some(exact) = registrations
            .iter()
            .find(|reg| reg.workspace_path == workspace)
        {
            return Ok(Route {
                registration: exact,
                reason: RouteReason::Exact,
            });
        }

        if let Some(found) = self.substring_match(registrations, workspace)? {
            debug!(
                "Workspace {workspace} loosely matched {} ({})",
                found.client_id, found.workspace_path
            );
            return Ok(Route {
                registration: found,
                reason: RouteReason::Substring,
            });
        }

        if !self.policy.fallback_to_default {
            return Err(RoutingFailure::NoMatchingClient {
                workspace: workspace.to_string(),
            });
        }

        warn!(
            "No client serves workspace {workspace}; using default client {}",
            default.client_id
        );
        Ok(Route {
            registration: default,
            reason: RouteReason::Fallback,
        })
    }

    fn substring_match<'a>(
        &self,
        registrations: &'a [ClientRegistration],
        workspace: &str,
    ) -> Result<Option<&'a ClientRegistration>, RoutingFailure> {
        let mut hits = registrations.iter().filter(|reg| {
            reg.workspace_path.contains(workspace) || workspace.contains(reg.workspace_path.as_str())
        });

        match self.policy.fuzzy {
            FuzzyMatch::Disabled => Ok(None),
            FuzzyMatch::FirstMatch => Ok(hits.next()),
            FuzzyMatch::RejectAmbiguous => {
                let hits: Vec<&ClientRegistration> = hits.collect();
                if hits.len() > 1 {
                    return Err(RoutingFailure::Ambiguous {
                        workspace: workspace.to_string(),
                        candidates: hits.iter().map(|reg| reg.client_id.clone()).collect(),
                    });
                }
                Ok(hits.first().copied())
            }
        }
    }
}
