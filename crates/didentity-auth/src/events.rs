//! Domain events announced to the message bus.
//!
//! Publishing is fire-and-forget: [`EventPublisher::publish`] cannot fail,
//! and a publisher that cannot deliver logs and drops the event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::UserId;

/// Kind of domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A user signed up.
    UserCreated,
    /// A user logged in.
    UserLogin,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserCreated => "user_created",
            Self::UserLogin => "user_login",
        })
    }
}

/// `{event_type, user_id, timestamp}` as published to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// What happened.
    pub event_type: EventType,
    /// Who it happened to.
    pub user_id: UserId,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Creates an event timestamped now.
    #[must_use]
    pub fn new(event_type: EventType, user_id: UserId) -> Self {
        Self {
            event_type,
            user_id,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for domain events.
pub trait EventPublisher: Send + Sync {
    /// Publishes an event without waiting for delivery.
    fn publish(&self, event: DomainEvent);
}

/// Publisher that writes events to `tracing` under the `didentity_events` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: DomainEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        info!(
            target: "didentity_events",
            event_type = %event.event_type,
            user_id = %event.user_id,
            timestamp = %event.timestamp,
            event_json = %json,
            "domain event"
        );
    }
}

/// Publisher that forwards events into a bounded channel, for a bus bridge.
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    tx: mpsc::Sender<DomainEvent>,
}

impl ChannelEventPublisher {
    /// Creates a publisher and the receiver a bus bridge drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventPublisher for ChannelEventPublisher {
    fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "dropping domain event");
        }
    }
}

/// Publisher that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, _event: DomainEvent) {}
}
