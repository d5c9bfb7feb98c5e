// Booking notifications. Delivery is fire-and-forget: a sink never reports
// failure back to the ledger and never runs inside a store transaction.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    circuit_breaker::{BreakerState, CircuitBreaker},
    config::{NotifierConfig, WebhookConfig},
    status::BookingStatus,
    types::{Booking, Room, UserId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        link: Option<String>,
    ) -> Self {
        Self {
            user_id,
            title: title.into(),
            message: message.into(),
            severity,
            link,
            created_at: Utc::now(),
            read: false,
        }
    }

    pub fn booking_created(booking: &Booking, room: &Room) -> Self {
        Self::new(
            booking.student_id,
            "Booking request submitted",
            format!(
                "Your request for room {} ({}) is pending approval.",
                room.room_number, booking.semester
            ),
            Severity::Info,
            Some(booking_link(booking)),
        )
    }

    pub fn status_changed(booking: &Booking, previous: BookingStatus) -> Self {
        let severity = match booking.status {
            BookingStatus::Confirmed => Severity::Success,
            BookingStatus::Rejected => Severity::Error,
            BookingStatus::Cancelled => Severity::Warning,
            BookingStatus::Pending => Severity::Info,
        };
        Self::new(
            booking.student_id,
            format!("Booking {}", booking.status.as_str().to_lowercase()),
            format!(
                "Your booking for {} moved from {} to {}.",
                booking.semester, previous, booking.status
            ),
            severity,
            Some(booking_link(booking)),
        )
    }
}

fn booking_link(booking: &Booking) -> String {
    format!("/housing/bookings/{}", booking.id)
}

pub trait NotificationSink: Send + Sync + 'static {
    // Must return promptly and must not panic on delivery failure
    fn notify(&self, notification: Notification);
}

pub fn sink_from_config(config: &NotifierConfig) -> anyhow::Result<Arc<dyn NotificationSink>> {
    Ok(match config {
        NotifierConfig::Inbox => Arc::new(InboxNotifier::new()),
        NotifierConfig::Disabled => Arc::new(NoopNotifier),
        NotifierConfig::Webhook(webhook) => Arc::new(WebhookNotifier::new(webhook)?),
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn notify(&self, notification: Notification) {
        debug!(user = %notification.user_id, title = %notification.title, "notification dropped");
    }
}

/// Per-user inbox kept in memory, newest last.
#[derive(Debug, Default)]
pub struct InboxNotifier {
    inbox: DashMap<UserId, Vec<Notification>>,
}

impl InboxNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(&self, user_id: UserId) -> Vec<Notification> {
        self.inbox
            .get(&user_id)
            .map(|n| n.value().clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, user_id: UserId) -> usize {
        self.inbox
            .get(&user_id)
            .map_or(0, |n| n.iter().filter(|n| !n.read).count())
    }

    // Returns how many were flipped
    pub fn mark_all_read(&self, user_id: UserId) -> usize {
        let Some(mut notifications) = self.inbox.get_mut(&user_id) else {
            return 0;
        };
        let mut marked = 0;
        for n in notifications.iter_mut().filter(|n| !n.read) {
            n.read = true;
            marked += 1;
        }
        marked
    }
}

impl NotificationSink for InboxNotifier {
    fn notify(&self, notification: Notification) {
        self.inbox
            .entry(notification.user_id)
            .or_default()
            .push(notification);
    }
}

/// POSTs each notification as JSON. Delivery happens on a spawned task; after
/// repeated failures the breaker opens and notifications are dropped until the
/// cool-down ends.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(
                config.failure_threshold,
                config.success_threshold,
                Duration::from_millis(config.open_duration_ms),
            ))),
        })
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state()
    }

    async fn deliver(
        client: reqwest::Client,
        url: String,
        breaker: Arc<Mutex<CircuitBreaker>>,
        notification: Notification,
    ) {
        let body = serde_json::json!({
            "event": "notification",
            "notification": notification,
        });

        let outcome = match client.post(&url).json(&body).send().await {
            Ok(response) => response.error_for_status().map(|_| ()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => breaker.lock().success(),
            Err(e) => {
                warn!(user = %notification.user_id, error = %e, "notification delivery failed");
                breaker.lock().fail();
            }
        }
    }
}

impl NotificationSink for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        if !self.breaker.lock().should_allow_call() {
            warn!(user = %notification.user_id, "notification webhook circuit open, dropping");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(user = %notification.user_id, "no async runtime, dropping notification");
            return;
        };

        runtime.spawn(Self::deliver(
            self.client.clone(),
            self.url.clone(),
            self.breaker.clone(),
            notification,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockId, BookingId, RoomId};

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: BookingId(12),
            student_id: UserId(3),
            room_id: RoomId(1),
            semester: "2025-FALL".to_string(),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_inbox_tracks_unread_per_user() {
        let inbox = InboxNotifier::new();
        inbox.notify(Notification::new(UserId(1), "a", "first", Severity::Info, None));
        inbox.notify(Notification::new(UserId(1), "b", "second", Severity::Warning, None));
        inbox.notify(Notification::new(UserId(2), "c", "other", Severity::Info, None));

        assert_eq!(inbox.for_user(UserId(1)).len(), 2);
        assert_eq!(inbox.unread_count(UserId(1)), 2);
        assert_eq!(inbox.mark_all_read(UserId(1)), 2);
        assert_eq!(inbox.unread_count(UserId(1)), 0);
        assert_eq!(inbox.mark_all_read(UserId(1)), 0);

        assert_eq!(inbox.unread_count(UserId(2)), 1);
        assert!(inbox.for_user(UserId(9)).is_empty());
    }

    #[test]
    fn test_booking_messages_carry_link_and_severity() {
        let room = Room {
            id: RoomId(1),
            block_id: BlockId(1),
            room_number: "A-101".to_string(),
            capacity: 2,
            current_occupancy: 1,
            price_per_semester: 800.0,
        };
        let created = Notification::booking_created(&booking(BookingStatus::Pending), &room);
        assert_eq!(created.user_id, UserId(3));
        assert_eq!(created.link.as_deref(), Some("/housing/bookings/12"));
        assert!(created.message.contains("A-101"));

        let rejected =
            Notification::status_changed(&booking(BookingStatus::Rejected), BookingStatus::Pending);
        assert_eq!(rejected.severity, Severity::Error);
        assert_eq!(rejected.title, "Booking rejected");
        assert!(rejected.message.contains("PENDING to REJECTED"));
    }

    #[test]
    fn test_notification_json_shape() {
        let n = Notification::new(UserId(5), "t", "m", Severity::Success, None);
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["user_id"], 5);
        assert_eq!(value["severity"], "success");
        assert_eq!(value["read"], false);
    }

    #[tokio::test]
    async fn test_webhook_failures_open_breaker() {
        // nothing listens on port 9 on the loopback
        let notifier = WebhookNotifier::new(&WebhookConfig {
            url: "http://127.0.0.1:9/notify".to_string(),
            timeout_ms: 200,
            failure_threshold: 1,
            success_threshold: 1,
            open_duration_ms: 60_000,
        })
        .unwrap();

        notifier.notify(Notification::new(UserId(1), "t", "m", Severity::Info, None));

        let mut state = notifier.breaker_state();
        for _ in 0..50 {
            if state == BreakerState::Open {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = notifier.breaker_state();
        }
        assert_eq!(state, BreakerState::Open);

        // dropped without spawning while open
        notifier.notify(Notification::new(UserId(1), "t", "m", Severity::Info, None));
        assert_eq!(notifier.breaker_state(), BreakerState::Open);
    }
}
