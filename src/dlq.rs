//! Dead Letter Queue for events that keep failing.
//!
//! A nacked delivery stays pending and is redelivered. Once it has been
//! delivered `max_deliveries` times it is written here for manual
//! investigation and acked on the source stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use herald::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(redis_pool, "herald:events:dlq");
//! dlq.add_failed_event(&event, "Delivery budget exhausted", 3, Some("1700000000000-0")).await?;
//! ```

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::{error, info};

use crate::event::Event;

/// Maximum entries to keep in DLQ (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// Dead Letter Queue backed by a Redis stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
    stream: String,
}

impl DeadLetterQueue {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    /// Append a failed event to the DLQ stream and return the new entry id.
    pub async fn add_failed_event(
        &self,
        event: &Event,
        error: &str,
        delivery_count: u64,
        original_id: Option<&str>,
    ) -> Result<String, DlqError> {
        let fields = entry_fields(
            event,
            error,
            delivery_count,
            original_id,
            &chrono::Utc::now().to_rfc3339(),
        )?;

        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::ConnectionError(e.to_string())
        })?;

        // MAXLEN keeps the stream from growing without bound
        let mut command = cmd("XADD");
        command
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*");
        for (name, value) in &fields {
            command.arg(*name).arg(value);
        }

        let id: String = command.query_async(&mut conn).await.map_err(|e| {
            error!(error = %e, "Failed to add event to DLQ");
            DlqError::RedisError(e.to_string())
        })?;

        info!(
            dlq_id = %id,
            original_id = ?original_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            delivery_count = delivery_count,
            "Event moved to Dead Letter Queue"
        );

        Ok(id)
    }
}

/// Flat stream fields describing one dead-lettered event.
fn entry_fields(
    event: &Event,
    error: &str,
    delivery_count: u64,
    original_id: Option<&str>,
    failed_at: &str,
) -> Result<Vec<(&'static str, String)>, DlqError> {
    let event_json = serde_json::to_string(event).map_err(|e| {
        error!(error = %e, "Failed to serialize event for DLQ");
        DlqError::SerializationError(e.to_string())
    })?;

    Ok(vec![
        ("event", event_json),
        ("error", error.to_string()),
        ("deliveryCount", delivery_count.to_string()),
        ("failedAt", failed_at.to_string()),
        ("originalId", original_id.unwrap_or_default().to_string()),
        ("eventType", event.event_type.clone()),
        ("correlationId", event.correlation_id.clone()),
    ])
}

/// Errors that can occur when writing to the Dead Letter Queue.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field<'a>(fields: &'a [(&'static str, String)], name: &str) -> &'a str {
        fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn test_entry_fields() {
        let event = Event::new("project.updated", json!({"id": 3})).with_correlation_id("c-1");
        let fields = entry_fields(
            &event,
            "Delivery budget exhausted",
            3,
            Some("1234567890-0"),
            "2025-12-11T12:00:00Z",
        )
        .unwrap();

        let stored: serde_json::Value = serde_json::from_str(field(&fields, "event")).unwrap();
        assert_eq!(stored["eventType"], "project.updated");
        assert_eq!(stored["payload"]["id"], 3);
        assert_eq!(field(&fields, "deliveryCount"), "3");
        assert_eq!(field(&fields, "originalId"), "1234567890-0");
        assert_eq!(field(&fields, "correlationId"), "c-1");
        assert_eq!(field(&fields, "failedAt"), "2025-12-11T12:00:00Z");
    }

    #[test]
    fn test_entry_fields_without_original_id() {
        let event = Event::new("project.member.added", json!({}));
        let fields = entry_fields(&event, "boom", 1, None, "now").unwrap();
        assert_eq!(field(&fields, "originalId"), "");
        assert_eq!(field(&fields, "error"), "boom");
    }
}
