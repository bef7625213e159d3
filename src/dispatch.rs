//! Dispatcher - the core of Herald.
//!
//! For each consumed event the [`Dispatcher`] runs the matching builder,
//! routes every resulting notification, feeds repost directives to the
//! [`RepostScheduler`], and settles the source delivery.
//!
//! # Flow
//!
//! ```text
//! Delivery (type: "project.updated")
//!     │
//!     ▼
//! ┌──────────────────────────────────────────────┐
//! │                DISPATCHER                    │
//! │                                              │
//! │  1. Build:   builders::build(event)          │
//! │  2. For each notification, in order:         │
//! │       Direct        -> publish (general)     │
//! │       Role          -> publish (role), then  │
//! │                        arm repost if asked   │
//! │       Repost(on)    -> arm repost            │
//! │       Repost(off)   -> cancel repost         │
//! │  3. Settle:  all ok -> ack, any error -> nack│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Unknown event types and malformed payloads build nothing and are acked.
//! A failure only affects its own event; the scheduler state of other roles
//! and other in-flight events is untouched.

use crate::audience::{AudienceResolver, Destination, RoutingError};
use crate::broker::{BrokerError, Delivery, Publisher};
use crate::builders::{self, BuildError, BuilderContext};
use crate::event::Event;
use crate::notification::Notification;
use crate::repost::{RepostError, RepostScheduler};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that fail the processing of one event.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("builder failed: {0}")]
    Build(#[from] BuildError),

    #[error("unresolvable routing target: {0}")]
    Routing(#[from] RoutingError),

    #[error("publish failed: {0}")]
    Publish(#[from] BrokerError),

    #[error("repost scheduling failed: {0}")]
    Repost(#[from] RepostError),

    #[error("failed to serialize notification: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What happened to one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub event_type: String,

    /// Notifications the builder produced
    pub built: usize,

    /// Messages published to general or role destinations
    pub published: usize,

    /// Repost timers armed or re-armed
    pub reposts_armed: usize,

    /// Repost timers cancelled (cancelling an idle role is not counted)
    pub reposts_cancelled: usize,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked,
}

/// Event-to-notification dispatch core.
///
/// Safe to share across concurrently processed deliveries; the only shared
/// mutable state is inside the [`RepostScheduler`].
pub struct Dispatcher {
    ctx: BuilderContext,
    resolver: AudienceResolver,
    publisher: Arc<dyn Publisher>,
    scheduler: RepostScheduler,
}

impl Dispatcher {
    pub fn new(
        ctx: BuilderContext,
        resolver: AudienceResolver,
        publisher: Arc<dyn Publisher>,
        scheduler: RepostScheduler,
    ) -> Self {
        Self {
            ctx,
            resolver,
            publisher,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &RepostScheduler {
        &self.scheduler
    }

    /// Build and deliver every notification for one event.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchResult, DispatchError> {
        debug!(
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            "Dispatching event"
        );

        let notifications = builders::build(&self.ctx, event).await?;

        let mut result = DispatchResult {
            event_type: event.event_type.clone(),
            built: notifications.len(),
            ..DispatchResult::default()
        };

        for notification in &notifications {
            self.deliver(notification, &mut result).await?;
        }

        info!(
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            built = result.built,
            published = result.published,
            reposts_armed = result.reposts_armed,
            reposts_cancelled = result.reposts_cancelled,
            "Event dispatched"
        );

        Ok(result)
    }

    /// Dispatch a delivery and settle it: ack on success, nack on failure.
    pub async fn process(&self, delivery: Delivery) -> Result<Settlement, BrokerError> {
        match self.dispatch(&delivery.event).await {
            Ok(_) => {
                delivery.ack().await?;
                Ok(Settlement::Acked)
            }
            Err(e) => {
                if let DispatchError::Routing(_)
                | DispatchError::Repost(RepostError::Routing(_)) = &e
                {
                    error!(
                        id = %delivery.id,
                        event_type = %delivery.event.event_type,
                        correlation_id = %delivery.event.correlation_id,
                        error = %e,
                        "Notification targets a role with no destination; check configuration"
                    );
                } else {
                    error!(
                        id = %delivery.id,
                        event_type = %delivery.event.event_type,
                        correlation_id = %delivery.event.correlation_id,
                        error = %e,
                        "Event processing failed"
                    );
                }
                delivery.nack().await?;
                Ok(Settlement::Nacked)
            }
        }
    }

    async fn deliver(
        &self,
        notification: &Notification,
        result: &mut DispatchResult,
    ) -> Result<(), DispatchError> {
        let destination = self.resolver.resolve(notification)?;
        debug!(
            notification = notification.label(),
            destination = %destination,
            "Delivering notification"
        );

        match notification {
            Notification::Direct(direct) => {
                if direct.recipients.is_empty() {
                    debug!(
                        notification_type = direct.notification_type.as_str(),
                        "Direct notification has no recipients, skipping"
                    );
                    return Ok(());
                }
                self.publish(&destination, &serde_json::to_value(direct)?)
                    .await?;
                result.published += 1;
            }
            Notification::Role(role) => {
                self.publish(&destination, &serde_json::to_value(&role.payload)?)
                    .await?;
                result.published += 1;

                // Only after the initial delivery succeeded
                if role.repost {
                    self.scheduler.arm(role.target, &role.payload).await?;
                    result.reposts_armed += 1;
                }
            }
            Notification::Repost(directive) => match (directive.active, &directive.payload) {
                (true, Some(payload)) => {
                    self.scheduler.arm(directive.target, payload).await?;
                    result.reposts_armed += 1;
                }
                (true, None) => {
                    warn!(
                        role = %directive.target,
                        "Active repost directive without payload, leaving schedule unchanged"
                    );
                }
                (false, _) => {
                    if self.scheduler.cancel(directive.target).await? {
                        result.reposts_cancelled += 1;
                    }
                }
            },
        }

        Ok(())
    }

    async fn publish(
        &self,
        destination: &Destination,
        payload: &Value,
    ) -> Result<(), BrokerError> {
        debug!(destination = %destination, "Publishing notification");
        self.publisher.publish(destination, payload, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience::AudiencePools;
    use crate::broker::{Acknowledger, MessageHeaders};
    use crate::config::DestinationsConfig;
    use crate::event::Role;
    use crate::test_utils::{member, project, user, RecordingPublisher, StubFetcher};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Settlements {
        acks: Mutex<Vec<String>>,
        nacks: Mutex<Vec<String>>,
    }

    struct TestAcker {
        id: String,
        log: Arc<Settlements>,
    }

    #[async_trait]
    impl Acknowledger for TestAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.log.acks.lock().unwrap().push(self.id.clone());
            Ok(())
        }

        async fn nack(&self) -> Result<(), BrokerError> {
            self.log.nacks.lock().unwrap().push(self.id.clone());
            Ok(())
        }
    }

    fn delivery(id: &str, event: Event, log: &Arc<Settlements>) -> Delivery {
        Delivery::new(
            id,
            event,
            Box::new(TestAcker {
                id: id.to_string(),
                log: log.clone(),
            }),
        )
    }

    fn dispatcher(publisher: Arc<RecordingPublisher>, fetcher: StubFetcher) -> Dispatcher {
        dispatcher_with(publisher, fetcher)
    }

    fn dispatcher_with(publisher: Arc<dyn Publisher>, fetcher: StubFetcher) -> Dispatcher {
        let resolver = AudienceResolver::new(&DestinationsConfig::default());
        let scheduler = RepostScheduler::with_interval(
            publisher.clone(),
            resolver.clone(),
            Duration::from_secs(10),
        );
        let ctx = BuilderContext::new(
            Arc::new(fetcher),
            AudiencePools {
                managers: vec![100],
                copilots: vec![200],
            },
            "https://app/projects",
        );
        Dispatcher::new(ctx, resolver, publisher, scheduler)
    }

    fn reviewed_event(with_copilot: bool) -> Event {
        let mut members = vec![json!({"userId": 1, "role": "customer", "isPrimary": true})];
        if with_copilot {
            members.push(json!({"userId": 3, "role": "copilot"}));
        }
        Event::new(
            "project.updated",
            json!({
                "original": {"id": 5, "status": "in_review", "members": members},
                "updated": {"id": 5, "status": "reviewed", "members": members},
            }),
        )
        .with_correlation_id("corr-5")
    }

    #[tokio::test]
    async fn test_unknown_event_is_acked() {
        let publisher = Arc::new(RecordingPublisher::default());
        let d = dispatcher(publisher.clone(), StubFetcher::default());
        let log = Arc::new(Settlements::default());

        let settled = d
            .process(delivery("1-0", Event::new("billing.invoice", json!({})), &log))
            .await
            .unwrap();

        assert_eq!(settled, Settlement::Acked);
        assert_eq!(*log.acks.lock().unwrap(), vec!["1-0"]);
        assert!(log.nacks.lock().unwrap().is_empty());
        assert_eq!(publisher.count(), 0);
    }

    #[tokio::test]
    async fn test_draft_created_publishes_to_general() {
        let publisher = Arc::new(RecordingPublisher::default());
        let d = dispatcher(publisher.clone(), StubFetcher::default());

        let event = Event::new(
            "project.draft-created",
            json!({"id": 1, "members": [{"userId": 7, "role": "customer", "isPrimary": true}]}),
        );
        let result = d.dispatch(&event).await.unwrap();
        assert_eq!(result.published, 1);

        let messages = publisher.messages();
        assert_eq!(messages[0].destination.exchange, "herald:notifications");
        assert_eq!(messages[0].payload["type"], "project.created");
        assert_eq!(messages[0].payload["recipients"][0]["id"], 7);
        assert!(messages[0].headers.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reviewed_publishes_in_order_then_arms() {
        let publisher = Arc::new(RecordingPublisher::default());
        let d = dispatcher(publisher.clone(), StubFetcher::default());

        let result = d.dispatch(&reviewed_event(false)).await.unwrap();
        assert_eq!(result.built, 3);
        assert_eq!(result.published, 3);
        assert_eq!(result.reposts_armed, 1);
        assert!(d.scheduler().is_active(Role::Copilot).await);

        let messages = publisher.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].payload["type"], "project.reviewed");
        assert_eq!(messages[1].payload["type"], "project.availableToClaim");
        assert_eq!(messages[2].destination.routing_key, "notifications.copilot");
        assert_eq!(messages[2].destination.exchange, "herald:roles");
        assert_eq!(messages[3].destination.exchange, "herald:roles:delayed");
        assert!(messages[3].headers.is_some());

        d.scheduler().shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_reminder_cancels_repost() {
        let publisher = Arc::new(RecordingPublisher::default());
        let d = dispatcher(publisher.clone(), StubFetcher::default());

        d.dispatch(&reviewed_event(false)).await.unwrap();
        assert!(d.scheduler().is_active(Role::Copilot).await);

        let reminder = Event::new(
            "project.claim.reminder",
            json!({"id": 5, "status": "reviewed", "members": [
                {"userId": 1, "role": "customer", "isPrimary": true},
                {"userId": 3, "role": "copilot"}
            ]}),
        );
        let result = d.dispatch(&reminder).await.unwrap();
        assert_eq!(result.reposts_cancelled, 1);
        assert!(!d.scheduler().is_active(Role::Copilot).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_role_publish_does_not_arm() {
        let recorder = Arc::new(RecordingPublisher::default());
        // Both direct notifications go through, the copilot role publish fails
        let d = dispatcher_with(Arc::new(FailAfter::new(recorder.clone(), 2)), StubFetcher::default());
        let log = Arc::new(Settlements::default());

        let settled = d
            .process(delivery("9-0", reviewed_event(false), &log))
            .await
            .unwrap();

        assert_eq!(settled, Settlement::Nacked);
        assert_eq!(*log.nacks.lock().unwrap(), vec!["9-0"]);
        assert_eq!(recorder.count(), 2);
        assert!(!d.scheduler().is_active(Role::Copilot).await);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_nacked() {
        let publisher = Arc::new(RecordingPublisher::default());
        let d = dispatcher(publisher.clone(), StubFetcher::default());
        let log = Arc::new(Settlements::default());

        let event = Event::new(
            "project.member.added",
            json!({"projectId": 1, "userId": 2, "role": "manager", "updatedBy": 1}),
        )
        .with_correlation_id("corr-err");

        let settled = d.process(delivery("2-0", event, &log)).await.unwrap();
        assert_eq!(settled, Settlement::Nacked);
        assert!(log.acks.lock().unwrap().is_empty());
        assert_eq!(publisher.count(), 0);
    }

    #[tokio::test]
    async fn test_member_removed_end_to_end() {
        let publisher = Arc::new(RecordingPublisher::default());
        let fetcher = StubFetcher::default()
            .with_project(project(
                1,
                vec![member(7, Role::Customer, true), member(9, Role::Manager, false)],
            ))
            .with_user(user(8, "leaver"));
        let d = dispatcher(publisher.clone(), fetcher);

        for (updated_by, subject) in [(8, "left"), (7, "removed")] {
            publisher.clear();
            let event = Event::new(
                "project.member.removed",
                json!({"projectId": 1, "userId": 8, "role": "customer", "updatedBy": updated_by}),
            );
            d.dispatch(&event).await.unwrap();

            let messages = publisher.messages();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].payload["subject"], subject);
            assert_eq!(messages[0].payload["recipients"], json!([
                {"id": 7, "params": {"projectId": 1, "projectName": "Project 1", "userId": 8,
                    "handle": "leaver", "firstName": "First", "lastName": "Last"}},
                {"id": 9, "params": {"projectId": 1, "projectName": "Project 1", "userId": 8,
                    "handle": "leaver", "firstName": "First", "lastName": "Last"}},
            ]));
        }
    }

    #[tokio::test]
    async fn test_customer_role_notification_fails_loudly() {
        let publisher = Arc::new(RecordingPublisher::default());
        let d = dispatcher(publisher.clone(), StubFetcher::default());
        let mut result = DispatchResult::default();

        let n = Notification::Role(crate::notification::RoleNotification {
            target: Role::Customer,
            payload: crate::test_utils::slack("x"),
            repost: false,
        });
        let err = d.deliver(&n, &mut result).await.unwrap_err();
        assert!(matches!(err, DispatchError::Routing(RoutingError::Unresolvable(Role::Customer))));
        assert_eq!(publisher.count(), 0);
    }

    /// Lets `n` publishes through, then fails every later one.
    struct FailAfter {
        inner: Arc<RecordingPublisher>,
        remaining: Mutex<usize>,
    }

    impl FailAfter {
        fn new(inner: Arc<RecordingPublisher>, n: usize) -> Self {
            Self {
                inner,
                remaining: Mutex::new(n),
            }
        }
    }

    #[async_trait]
    impl Publisher for FailAfter {
        async fn publish(
            &self,
            destination: &Destination,
            payload: &Value,
            headers: Option<&MessageHeaders>,
        ) -> Result<(), BrokerError> {
            {
                let mut remaining = self.remaining.lock().unwrap();
                if *remaining == 0 {
                    return Err(BrokerError::Command("broker unavailable".to_string()));
                }
                *remaining -= 1;
            }
            self.inner.publish(destination, payload, headers).await
        }
    }
}
