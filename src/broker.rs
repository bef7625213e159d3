//! Broker plumbing over Redis Streams.
//!
//! The dispatch core only sees two narrow seams:
//!
//! - [`Publisher`]: `publish(destination, payload, headers)`
//! - [`Delivery`]: one consumed event plus exactly-one-of `ack()` / `nack()`
//!
//! [`RedisPublisher`] and [`RedisConsumer`] implement them with a consumer
//! group on the source stream. A nacked entry stays pending and is reclaimed
//! with `XAUTOCLAIM` once idle; after `max_deliveries` attempts it is moved to
//! the dead-letter stream instead.
//!
//! ```text
//! source stream ──XREADGROUP──► Delivery ──► Dispatcher
//!                                  │ ack  -> XACK
//!                                  │ nack -> leave pending (redelivered)
//!                                  │         or DLQ + XACK when exhausted
//! ```

use crate::audience::Destination;
use crate::config::BrokerConfig;
use crate::dlq::{DeadLetterQueue, DlqError};
use crate::event::Event;
use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Start (and end) id of an `XAUTOCLAIM` scan
const CLAIM_START: &str = "0-0";

/// Errors raised by broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dead-letter error: {0}")]
    DeadLetter(#[from] DlqError),

    #[error("delivery {0} was already settled")]
    AlreadySettled(String),
}

/// Optional publish headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Delay directive for the delayed-delivery path
    pub delay_ms: Option<u64>,
}

impl MessageHeaders {
    pub fn delayed(delay_ms: u64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
        }
    }
}

/// Publishes payloads to a destination.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &Value,
        headers: Option<&MessageHeaders>,
    ) -> Result<(), BrokerError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self) -> Result<(), BrokerError>;
}

/// One consumed event and the handle used to settle it.
///
/// Settling consumes the delivery, so a delivery is acked or nacked at most
/// once.
pub struct Delivery {
    pub id: String,
    pub event: Event,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(id: impl Into<String>, event: Event, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            id: id.into(),
            event,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}

/// Publishes to destination streams with `XADD`.
///
/// The destination exchange is the stream key; the routing key, payload and
/// optional `delayMs` are stored as entry fields.
#[derive(Clone)]
pub struct RedisPublisher {
    pool: Pool,
}

impl RedisPublisher {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &Value,
        headers: Option<&MessageHeaders>,
    ) -> Result<(), BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let body = serde_json::to_string(payload)?;
        let published_at = chrono::Utc::now().to_rfc3339();

        let mut command = cmd("XADD");
        command
            .arg(&destination.exchange)
            .arg("*")
            .arg("routingKey")
            .arg(&destination.routing_key)
            .arg("payload")
            .arg(body)
            .arg("publishedAt")
            .arg(&published_at);

        if let Some(delay_ms) = headers.and_then(|h| h.delay_ms) {
            command.arg("delayMs").arg(delay_ms);
        }

        let id: String = command
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        debug!(
            id = %id,
            destination = %destination,
            delayed = headers.and_then(|h| h.delay_ms).is_some(),
            "Published message"
        );

        Ok(())
    }
}

/// Consumer-group reader over the source stream.
#[derive(Clone)]
pub struct RedisConsumer {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    prefetch: usize,
    max_deliveries: u64,
    claim_idle_ms: u64,
    dlq: DeadLetterQueue,
}

impl RedisConsumer {
    pub fn new(pool: Pool, config: &BrokerConfig, consumer: impl Into<String>) -> Self {
        Self {
            dlq: DeadLetterQueue::new(pool.clone(), &config.dlq_stream),
            pool,
            stream: config.source_stream.clone(),
            group: config.consumer_group.clone(),
            consumer: consumer.into(),
            prefetch: config.prefetch,
            max_deliveries: config.max_deliveries,
            claim_idle_ms: config.claim_idle_ms,
        }
    }

    /// Create the consumer group (and stream) if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(consumer_group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(consumer_group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BrokerError::Command(e.to_string())),
        }
    }

    /// Read up to `prefetch` new entries, blocking for at most `block_ms`.
    pub async fn receive(&self, block_ms: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(block_ms)
            .count(self.prefetch);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                if let Some(delivery) = self.to_delivery(entry).await? {
                    deliveries.push(delivery);
                }
            }
        }

        Ok(deliveries)
    }

    /// Reclaim pending entries idle for longer than `claim_idle_ms` so they are
    /// redelivered to this consumer. Follows the `XAUTOCLAIM` cursor until the
    /// whole pending list has been scanned.
    pub async fn reclaim(&self) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut cursor = CLAIM_START.to_string();
        let mut claimed = Vec::new();

        loop {
            // XAUTOCLAIM key group consumer min-idle-time start COUNT count
            let (next, entries, ..): (String, Vec<(String, HashMap<String, RedisValue>)>, Vec<String>) =
                cmd("XAUTOCLAIM")
                    .arg(&self.stream)
                    .arg(&self.group)
                    .arg(&self.consumer)
                    .arg(self.claim_idle_ms)
                    .arg(&cursor)
                    .arg("COUNT")
                    .arg(self.prefetch)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| BrokerError::Command(e.to_string()))?;

            claimed.extend(entries);
            match next_claim_cursor(&next) {
                Some(next) => cursor = next.to_string(),
                None => break,
            }
        }

        if !claimed.is_empty() {
            info!(count = claimed.len(), "Reclaimed pending events for redelivery");
        }

        let mut deliveries = Vec::new();
        for (id, map) in claimed {
            if let Some(delivery) = self.to_delivery(StreamId { id, map }).await? {
                deliveries.push(delivery);
            }
        }

        Ok(deliveries)
    }

    fn acker(&self, id: &str, event: Option<Event>) -> RedisAcker {
        RedisAcker {
            pool: self.pool.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            id: id.to_string(),
            event,
            max_deliveries: self.max_deliveries,
            dlq: self.dlq.clone(),
            settled: AtomicBool::new(false),
        }
    }

    /// Turn a stream entry into a delivery. Entries without an event type
    /// cannot be processed or retried, so they are acked and skipped.
    async fn to_delivery(&self, entry: StreamId) -> Result<Option<Delivery>, BrokerError> {
        match parse_event(&entry.map) {
            Some(event) => {
                let acker = self.acker(&entry.id, Some(event.clone()));
                Ok(Some(Delivery::new(entry.id, event, Box::new(acker))))
            }
            None => {
                warn!(id = %entry.id, "Skipping unparseable event");
                self.acker(&entry.id, None).ack().await?;
                Ok(None)
            }
        }
    }
}

/// Settles one source stream entry.
struct RedisAcker {
    pool: Pool,
    stream: String,
    group: String,
    id: String,
    event: Option<Event>,
    max_deliveries: u64,
    dlq: DeadLetterQueue,
    settled: AtomicBool,
}

impl RedisAcker {
    fn settle(&self) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadySettled(self.id.clone()));
        }
        Ok(())
    }

    async fn xack(&self) -> Result<(), BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let _: u64 = conn
            .xack(&self.stream, &self.group, &[&self.id])
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }

    /// Times this entry has been delivered, from `XPENDING`.
    async fn delivery_count(&self) -> Result<u64, BrokerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let pending: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.id)
            .arg(&self.id)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        Ok(pending_delivery_count(&pending))
    }
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        self.xack().await
    }

    async fn nack(&self) -> Result<(), BrokerError> {
        self.settle()?;

        let deliveries = self.delivery_count().await?;
        match nack_outcome(deliveries, self.max_deliveries) {
            NackOutcome::Redeliver => {
                debug!(
                    id = %self.id,
                    deliveries = deliveries,
                    max_deliveries = self.max_deliveries,
                    "Leaving event pending for redelivery"
                );
                Ok(())
            }
            NackOutcome::DeadLetter => {
                warn!(
                    id = %self.id,
                    deliveries = deliveries,
                    max_deliveries = self.max_deliveries,
                    "Delivery budget exhausted, moving to DLQ"
                );

                if let Some(event) = &self.event {
                    self.dlq
                        .add_failed_event(event, "Delivery budget exhausted", deliveries, Some(&self.id))
                        .await?;
                }
                self.xack().await
            }
        }
    }
}

/// What a nack does with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NackOutcome {
    /// Leave it pending so it is reclaimed and redelivered
    Redeliver,
    /// Write it to the DLQ, then ack it
    DeadLetter,
}

fn nack_outcome(deliveries: u64, max_deliveries: u64) -> NackOutcome {
    if deliveries < max_deliveries {
        NackOutcome::Redeliver
    } else {
        NackOutcome::DeadLetter
    }
}

/// Delivery count from an `XPENDING` range reply. An entry missing from the
/// reply counts as a single delivery.
fn pending_delivery_count(pending: &[(String, String, u64, u64)]) -> u64 {
    pending.first().map(|(_, _, _, count)| *count).unwrap_or(1)
}

/// Cursor to continue an `XAUTOCLAIM` scan from, `None` once it wrapped.
fn next_claim_cursor(cursor: &str) -> Option<&str> {
    (cursor != CLAIM_START).then_some(cursor)
}

/// Parse an Event from Redis stream data.
fn parse_event(map: &HashMap<String, RedisValue>) -> Option<Event> {
    let event_type = get_str_field(map, "eventType")?;
    let correlation_id = get_str_field(map, "correlationId").unwrap_or_default();

    let payload = match get_str_field(map, "payload") {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, event_type = %event_type, "Failed to parse event payload, using null");
                Value::Null
            }
        },
        None => Value::Null,
    };

    Some(Event {
        event_type,
        correlation_id,
        payload,
    })
}

/// Extract a non-empty string field from Redis stream data.
fn get_str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => {
            let s = String::from_utf8_lossy(bytes).to_string();
            (!s.is_empty()).then_some(s)
        }
        RedisValue::SimpleString(s) => (!s.is_empty()).then(|| s.clone()),
        _ => None,
    })
}
