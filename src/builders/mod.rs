//! Notification builders.
//!
//! One builder per [`EventKind`]; each maps an event payload to an ordered
//! list of [`Notification`]s (possibly empty). Builders that need current
//! project or user state fetch exactly what they use through the
//! [`RecordFetcher`]; the rest are plain synchronous functions.
//!
//! | Event                    | Builder                              | Fetches        |
//! |--------------------------|--------------------------------------|----------------|
//! | `project.draft-created`  | [`draft_created::build`]             | none           |
//! | `project.updated`        | [`project_updated::build`]           | none           |
//! | `project.claim.reminder` | [`claim_reminder::build`]            | none           |
//! | `project.member.added`   | [`members::added`]                   | project + user |
//! | `project.member.removed` | [`members::removed`]                 | project + user |
//! | `project.member.updated` | [`members::updated`]                 | project + user |
//!
//! Unknown event types and payloads that do not decode produce no
//! notifications. Fetch failures are returned as [`BuildError`].

pub mod claim_reminder;
pub mod draft_created;
pub mod members;
pub mod project_updated;
pub mod slack;

use crate::audience::AudiencePools;
use crate::event::{Event, EventKind, Project, User};
use crate::fetcher::{FetchError, RecordFetcher};
use crate::notification::Notification;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("record fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

/// Shared collaborators and settings for builders.
#[derive(Clone)]
pub struct BuilderContext {
    pub fetcher: Arc<dyn RecordFetcher>,
    pub pools: AudiencePools,
    /// Base for project links in role summaries
    pub project_url: String,
}

impl BuilderContext {
    pub fn new(
        fetcher: Arc<dyn RecordFetcher>,
        pools: AudiencePools,
        project_url: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            pools,
            project_url: project_url.into(),
        }
    }

    /// Fetch a project and a user concurrently; fails if either fails.
    pub async fn fetch_project_and_user(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<(Project, User), FetchError> {
        tokio::try_join!(
            self.fetcher.fetch_project(project_id),
            self.fetcher.fetch_user(user_id)
        )
    }
}

/// Build the notifications for one event.
pub async fn build(ctx: &BuilderContext, event: &Event) -> Result<Vec<Notification>, BuildError> {
    let notifications = match event.kind() {
        EventKind::DraftCreated => match decode(event) {
            Some(project) => draft_created::build(&project),
            None => Vec::new(),
        },
        EventKind::Updated => match decode(event) {
            Some(update) => project_updated::build(ctx, &update),
            None => Vec::new(),
        },
        EventKind::ClaimReminder => match decode(event) {
            Some(project) => claim_reminder::build(ctx, &project),
            None => Vec::new(),
        },
        EventKind::MemberAdded => match decode(event) {
            Some(change) => members::added(ctx, &change).await?,
            None => Vec::new(),
        },
        EventKind::MemberRemoved => match decode(event) {
            Some(change) => members::removed(ctx, &change).await?,
            None => Vec::new(),
        },
        EventKind::MemberUpdated => match decode(event) {
            Some(change) => members::updated(ctx, &change).await?,
            None => Vec::new(),
        },
        EventKind::Unknown(event_type) => {
            debug!(event_type = %event_type, "No builder for event type");
            Vec::new()
        }
    };

    Ok(notifications)
}

/// Decode an event payload, logging and skipping malformed ones.
fn decode<T: DeserializeOwned>(event: &Event) -> Option<T> {
    match serde_json::from_value(event.payload.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                error = %e,
                "Malformed event payload, skipping"
            );
            None
        }
    }
}

/// Recipient params describing a project.
pub(crate) fn project_params(project: &Project) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("projectId".to_string(), json!(project.id));
    params.insert("projectName".to_string(), json!(project.name));
    params
}

/// Recipient params describing a project and the user a change is about.
pub(crate) fn project_user_params(project: &Project, user: &User) -> Map<String, Value> {
    let mut params = project_params(project);
    params.insert("userId".to_string(), json!(user.user_id));
    params.insert("handle".to_string(), json!(user.handle));
    params.insert("firstName".to_string(), json!(user.first_name));
    params.insert("lastName".to_string(), json!(user.last_name));
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Role;
    use crate::test_utils::{member, project, user, StubFetcher};

    fn ctx(fetcher: StubFetcher) -> BuilderContext {
        BuilderContext::new(Arc::new(fetcher), AudiencePools::default(), "https://app/projects")
    }

    #[tokio::test]
    async fn test_unknown_event_builds_nothing() {
        let fetcher = Arc::new(StubFetcher::default());
        let ctx = BuilderContext::new(fetcher.clone(), AudiencePools::default(), "https://app");
        let event = Event::new("project.archived", json!({"id": 1}));

        let result = build(&ctx, &event).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_builds_nothing() {
        let event = Event::new("project.updated", json!({"unexpected": true}));
        let result = build(&ctx(StubFetcher::default()), &event).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        // Project 9 is unknown to the stub, so the lookup answers 404
        let event = Event::new(
            "project.member.added",
            json!({"projectId": 9, "userId": 1, "role": "customer", "updatedBy": 1}),
        );

        let err = build(&ctx(StubFetcher::default()), &event).await.unwrap_err();
        assert!(matches!(err, BuildError::Fetch(FetchError::Status { .. })));
    }

    #[tokio::test]
    async fn test_fetch_project_and_user() {
        let fetcher = StubFetcher::default()
            .with_project(project(1, vec![member(7, Role::Customer, true)]))
            .with_user(user(7, "ada"));
        let ctx = ctx(fetcher);

        let (p, u) = ctx.fetch_project_and_user(1, 7).await.unwrap();
        assert_eq!(p.id, 1);
        assert_eq!(u.handle, "ada");
        assert!(ctx.fetch_project_and_user(1, 8).await.is_err());
    }

    #[test]
    fn test_project_user_params() {
        let params = project_user_params(&project(3, vec![]), &user(5, "grace"));
        assert_eq!(params["projectId"], 3);
        assert_eq!(params["projectName"], "Project 3");
        assert_eq!(params["userId"], 5);
        assert_eq!(params["handle"], "grace");
    }
}
