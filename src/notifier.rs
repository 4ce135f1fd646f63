// Booking notifications
// Events are published after the transaction that produced them has committed.
// Delivery is best effort: a failing notifier is logged and never undoes a booking.

use crate::model::{BookingId, Money, PaymentStatus, RoomId, ServiceId};
use crate::stay_status::StayStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BookingEvent {
    Created {
        booking_id: BookingId,
        customer_name: String,
        customer_email: Option<String>,
        stay_status: StayStatus,
        total_price: Money,
        room_ids: Vec<RoomId>,
    },
    StatusChanged {
        booking_id: BookingId,
        from: StayStatus,
        to: StayStatus,
        at: DateTime<Utc>,
    },
    ServiceAdded {
        booking_id: BookingId,
        service_id: ServiceId,
        quantity: u32,
        total_price: Money,
    },
    PaymentChanged {
        booking_id: BookingId,
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

impl BookingEvent {
    pub fn booking_id(&self) -> BookingId {
        match self {
            BookingEvent::Created { booking_id, .. }
            | BookingEvent::StatusChanged { booking_id, .. }
            | BookingEvent::ServiceAdded { booking_id, .. }
            | BookingEvent::PaymentChanged { booking_id, .. } => *booking_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BookingEvent::Created { .. } => "created",
            BookingEvent::StatusChanged { .. } => "status_changed",
            BookingEvent::ServiceAdded { .. } => "service_added",
            BookingEvent::PaymentChanged { .. } => "payment_changed",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Receiver rejected notification with status {0}")]
    Rejected(u16),

    #[error("Notification channel closed")]
    ChannelClosed,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, event: &BookingEvent) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &BookingEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

// Hands events to an in-process consumer, e.g. a mailer task.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<BookingEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BookingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: &BookingEvent) -> Result<(), NotifyError> {
        self.sender
            .send(event.clone())
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

// POSTs every event as JSON to an external endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| NotifyError::Delivery(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &BookingEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|err| NotifyError::Delivery(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        tracing::debug!(
            booking_id = %event.booking_id(),
            event = event.name(),
            "Webhook notification delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_changed() -> BookingEvent {
        BookingEvent::StatusChanged {
            booking_id: BookingId(3),
            from: StayStatus::Pending,
            to: StayStatus::Reserved,
            at: DateTime::parse_from_rfc3339("2025-06-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn test_channel_notifier_forwards_events() {
        let (notifier, mut receiver) = ChannelNotifier::new();
        notifier.notify(&status_changed()).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.booking_id(), BookingId(3));
        assert_eq!(received.name(), "status_changed");
    }

    #[tokio::test]
    async fn test_channel_notifier_reports_closed_receiver() {
        let (notifier, receiver) = ChannelNotifier::new();
        drop(receiver);

        assert_eq!(
            notifier.notify(&status_changed()).await,
            Err(NotifyError::ChannelClosed)
        );
    }

    #[test]
    fn test_events_serialize_with_a_tag() {
        let json = serde_json::to_value(status_changed()).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["from"], "pending");
        assert_eq!(json["to"], "reserved");
        assert_eq!(json["booking_id"], 3);
    }

    #[tokio::test]
    async fn test_webhook_to_unreachable_host_is_a_delivery_error() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hooks", Duration::from_millis(200)).unwrap();
        let result = notifier.notify(&status_changed()).await;
        assert!(matches!(result, Err(NotifyError::Delivery(_))));
    }
}
