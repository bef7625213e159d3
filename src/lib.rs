//! # Herald
//!
//! Bridges project lifecycle events into audience-specific notification
//! streams.
//!
//! ## Architecture
//!
//! ```text
//! source stream -> Delivery -> Dispatcher -> builders -> AudienceResolver -> Publisher
//!                     ▲                                      │
//!                     └──── ack / nack ◄─────────────────────┤
//!                                                            └─► RepostScheduler (delayed path)
//! ```
//!
//! ## Modules
//!
//! - [`event`]: inbound events, event kinds and project records
//! - [`notification`]: outbound notification descriptors
//! - [`builders`]: per-event notification builders
//! - [`audience`]: recipient sets and destination resolution
//! - [`repost`]: recurring re-announcements per role
//! - [`dispatch`]: the per-event dispatch loop
//! - [`broker`], [`dlq`], [`fetcher`]: Redis and HTTP collaborators

pub mod audience;
pub mod broker;
pub mod builders;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod event;
pub mod fetcher;
pub mod notification;
pub mod repost;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types at crate root
pub use dispatch::{Dispatcher, Settlement};
pub use event::{Event, EventKind};
pub use notification::Notification;
pub use repost::RepostScheduler;

/// Default source stream for project events
pub const EVENT_STREAM_NAME: &str = "herald:events";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "herald_workers";

/// Default dead-letter stream
pub const DLQ_STREAM_NAME: &str = "herald:events:dlq";
