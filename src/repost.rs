//! Repost scheduler.
//!
//! Keeps re-announcing a role message on the delayed-delivery path until a
//! cancelling directive arrives. Each role (manager, copilot) is an
//! independent two-state machine:
//!
//! ```text
//!            arm(P)                    arm(Q): replace payload, re-arm
//!   ┌──────┐ ──────────────► ┌────────┐ ◄───┐
//!   │ Idle │                 │ Active │ ────┘
//!   └──────┘ ◄────────────── └────────┘
//!            cancel()           │ every interval: publish payload (delayed)
//! ```
//!
//! Every role slot sits behind its own async mutex. Arming, cancelling and
//! each timer tick all take that lock, and a tick only publishes while its
//! generation is still the slot's current one, so a cancelled or replaced
//! timer can never publish again.

use crate::audience::{AudienceResolver, RoutingError};
use crate::broker::{BrokerError, MessageHeaders, Publisher};
use crate::event::Role;
use crate::notification::SlackMessage;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default interval between reposts
pub const DEFAULT_REPOST_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RepostError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("initial repost publish failed: {0}")]
    Publish(#[from] BrokerError),

    #[error("failed to serialize repost payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A live repeating announcement for one role.
struct RepostTimer {
    generation: u64,
    payload: Value,
    handle: JoinHandle<()>,
}

type Slot = Mutex<Option<RepostTimer>>;

struct Inner {
    slots: HashMap<Role, Slot>,
    publisher: Arc<dyn Publisher>,
    resolver: AudienceResolver,
    interval: Duration,
    generations: AtomicU64,
}

impl Inner {
    fn slot(&self, role: Role) -> Result<&Slot, RoutingError> {
        self.slots.get(&role).ok_or(RoutingError::Unresolvable(role))
    }

    async fn publish_delayed(&self, role: Role, payload: &Value) -> Result<(), RepostError> {
        let destination = self.resolver.delayed_for_role(role)?;
        let headers = MessageHeaders::delayed(self.interval.as_millis() as u64);
        self.publisher
            .publish(&destination, payload, Some(&headers))
            .await?;
        Ok(())
    }
}

/// Owns the per-role repost timers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RepostScheduler {
    inner: Arc<Inner>,
}

impl RepostScheduler {
    pub fn new(publisher: Arc<dyn Publisher>, resolver: AudienceResolver) -> Self {
        Self::with_interval(publisher, resolver, DEFAULT_REPOST_INTERVAL)
    }

    /// A zero `interval` falls back to [`DEFAULT_REPOST_INTERVAL`].
    pub fn with_interval(
        publisher: Arc<dyn Publisher>,
        resolver: AudienceResolver,
        interval: Duration,
    ) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                fallback_ms = DEFAULT_REPOST_INTERVAL.as_millis() as u64,
                "Zero repost interval requested, using the default"
            );
            DEFAULT_REPOST_INTERVAL
        } else {
            interval
        };

        let slots = [Role::Manager, Role::Copilot]
            .into_iter()
            .map(|role| (role, Mutex::new(None)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                slots,
                publisher,
                resolver,
                interval,
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Start or replace the repeating announcement for `role`.
    ///
    /// Publishes `payload` once to the delayed path, then arms a timer that
    /// republishes it every interval. An existing timer for the role is
    /// released first. If the initial publish fails nothing is armed and any
    /// previous timer keeps running.
    pub async fn arm(&self, role: Role, payload: &SlackMessage) -> Result<(), RepostError> {
        let payload = serde_json::to_value(payload)?;
        let mut slot = self.inner.slot(role)?.lock().await;

        self.inner.publish_delayed(role, &payload).await?;

        let replaced = match slot.take() {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let first_tick = Instant::now() + self.inner.interval;
        let handle = tokio::spawn(tick_loop(self.inner.clone(), role, generation, first_tick));
        *slot = Some(RepostTimer {
            generation,
            payload,
            handle,
        });

        info!(
            role = %role,
            generation = generation,
            replaced = replaced,
            interval_ms = self.inner.interval.as_millis() as u64,
            "Repost armed"
        );
        Ok(())
    }

    /// Stop the repeating announcement for `role`. A no-op when idle.
    pub async fn cancel(&self, role: Role) -> Result<bool, RepostError> {
        let mut slot = self.inner.slot(role)?.lock().await;

        match slot.take() {
            Some(timer) => {
                timer.handle.abort();
                info!(role = %role, generation = timer.generation, "Repost cancelled");
                Ok(true)
            }
            None => {
                debug!(role = %role, "Repost cancel on idle role");
                Ok(false)
            }
        }
    }

    /// Whether `role` currently has a live timer.
    pub async fn is_active(&self, role: Role) -> bool {
        match self.inner.slots.get(&role) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Payload currently scheduled for `role`.
    pub async fn payload(&self, role: Role) -> Option<Value> {
        let slot = self.inner.slots.get(&role)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|t| t.payload.clone())
    }

    /// Number of live timers across all roles.
    pub async fn active_count(&self) -> usize {
        let mut count = 0;
        for slot in self.inner.slots.values() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Cancel every live timer.
    pub async fn shutdown(&self) {
        for (role, slot) in &self.inner.slots {
            if let Some(timer) = slot.lock().await.take() {
                timer.handle.abort();
                info!(role = %role, "Repost stopped for shutdown");
            }
        }
    }
}

/// Timer body: wait for `first_tick`, then republish every interval while
/// this generation is still current.
async fn tick_loop(inner: Arc<Inner>, role: Role, generation: u64, first_tick: Instant) {
    let mut ticker = tokio::time::interval_at(first_tick, inner.interval);

    loop {
        ticker.tick().await;

        let Ok(slot) = inner.slot(role) else {
            return;
        };
        let guard = slot.lock().await;
        let payload = match guard.as_ref() {
            Some(timer) if timer.generation == generation => timer.payload.clone(),
            _ => return,
        };

        // Publish under the lock so cancel/arm cannot interleave with a tick
        match inner.publish_delayed(role, &payload).await {
            Ok(()) => debug!(role = %role, generation = generation, "Reposted"),
            Err(e) => warn!(role = %role, error = %e, "Repost publish failed, will retry next tick"),
        }
        drop(guard);
    }
}
