//! Audience resolution.
//!
//! Two concerns live here: computing recipient id sets from project
//! membership, and deciding which destination a notification goes to.
//!
//! ```text
//! Notification
//!     │
//!     ├── Direct            -> general exchange / general routing key
//!     ├── Role(manager)     -> role exchange    / manager routing key
//!     ├── Role(copilot)     -> role exchange    / copilot routing key
//!     └── Role(customer)    -> RoutingError::Unresolvable
//! ```

use crate::config::DestinationsConfig;
use crate::event::{Member, Project, Role};
use crate::notification::Notification;
use std::collections::BTreeSet;
use thiserror::Error;

/// A target role outside {manager, copilot}. Configuration or programming
/// error, never a data error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no destination configured for role '{0}'")]
    Unresolvable(Role),
}

/// Where a payload is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Maps notifications to destinations. The mapping is fixed configuration.
#[derive(Debug, Clone)]
pub struct AudienceResolver {
    general: Destination,
    role_exchange: String,
    delayed_exchange: String,
    manager_routing_key: String,
    copilot_routing_key: String,
}

impl AudienceResolver {
    pub fn new(config: &DestinationsConfig) -> Self {
        Self {
            general: Destination {
                exchange: config.general_exchange.clone(),
                routing_key: config.general_routing_key.clone(),
            },
            role_exchange: config.role_exchange.clone(),
            delayed_exchange: config.delayed_exchange.clone(),
            manager_routing_key: config.manager_routing_key.clone(),
            copilot_routing_key: config.copilot_routing_key.clone(),
        }
    }

    /// Destination for a notification.
    pub fn resolve(&self, notification: &Notification) -> Result<Destination, RoutingError> {
        match notification.target() {
            None => Ok(self.general.clone()),
            Some(role) => self.for_role(role),
        }
    }

    /// Immediate destination for a role.
    pub fn for_role(&self, role: Role) -> Result<Destination, RoutingError> {
        Ok(Destination {
            exchange: self.role_exchange.clone(),
            routing_key: self.routing_key(role)?.to_string(),
        })
    }

    /// Delayed-delivery destination for a role, used by reposts.
    pub fn delayed_for_role(&self, role: Role) -> Result<Destination, RoutingError> {
        Ok(Destination {
            exchange: self.delayed_exchange.clone(),
            routing_key: self.routing_key(role)?.to_string(),
        })
    }

    fn routing_key(&self, role: Role) -> Result<&str, RoutingError> {
        match role {
            Role::Manager => Ok(&self.manager_routing_key),
            Role::Copilot => Ok(&self.copilot_routing_key),
            Role::Customer => Err(RoutingError::Unresolvable(role)),
        }
    }
}

/// Known manager and copilot user ids, independent of any one project.
#[derive(Debug, Clone, Default)]
pub struct AudiencePools {
    pub managers: Vec<i64>,
    pub copilots: Vec<i64>,
}

impl AudiencePools {
    /// Union of managers and copilots, deduplicated, in ascending order.
    pub fn reviewers(&self) -> Vec<i64> {
        self.managers
            .iter()
            .chain(self.copilots.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn copilots(&self) -> Vec<i64> {
        dedup(self.copilots.iter().copied())
    }
}

/// The primary customer member, if the project has one.
pub fn primary_customer(project: &Project) -> Option<&Member> {
    project
        .members
        .iter()
        .find(|m| m.role == Role::Customer && m.is_primary)
}

/// Every current member id, first occurrence order.
pub fn member_ids(project: &Project) -> Vec<i64> {
    dedup(project.members.iter().map(|m| m.user_id))
}

/// Member ids holding `role`, first occurrence order.
pub fn member_ids_with_role(project: &Project, role: Role) -> Vec<i64> {
    dedup(
        project
            .members
            .iter()
            .filter(|m| m.role == role)
            .map(|m| m.user_id),
    )
}

pub fn has_copilot(project: &Project) -> bool {
    project.members.iter().any(|m| m.role == Role::Copilot)
}

fn dedup(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut seen = BTreeSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}
