//! Billing event emission
//!
//! Every status transition and billing outcome emits an event for the
//! surrounding notification system. Delivery is fire-and-forget: the core
//! never blocks on a sink and never retries on the consumer's behalf.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Kinds of billing events the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    Subscribed,
    Canceled,
    Resumed,
    Swapped,
    BillingSucceeded,
    BillingFailed,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::Subscribed => "subscribed",
            BillingEventType::Canceled => "canceled",
            BillingEventType::Resumed => "resumed",
            BillingEventType::Swapped => "swapped",
            BillingEventType::BillingSucceeded => "billing_succeeded",
            BillingEventType::BillingFailed => "billing_failed",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One emitted billing event
#[derive(Debug, Clone, Serialize)]
pub struct BillingEvent {
    #[serde(rename = "type")]
    pub event_type: BillingEventType,
    pub subscription_id: Uuid,
    pub owner_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl BillingEvent {
    pub fn new(
        event_type: BillingEventType,
        subscription_id: Uuid,
        owner_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            subscription_id,
            owner_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Consumer boundary for billing events. Implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BillingEvent);
}

/// Sink that logs events as structured tracing records. The default when no
/// notification system is attached.
#[derive(Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: BillingEvent) {
        info!(
            event_type = %event.event_type,
            subscription_id = %event.subscription_id,
            owner_id = %event.owner_id,
            payload = %event.payload,
            "billing event"
        );
    }
}

/// Sink that forwards events into an unbounded channel; send errors are
/// dropped because a closed receiver is the consumer's problem, not ours.
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::UnboundedSender<BillingEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<BillingEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: BillingEvent) {
        let _ = self.sender.send(event);
    }
}
