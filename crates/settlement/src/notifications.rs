//! Real-time notification fan-out
//!
//! Notifications never fail a financial operation. Publish errors are logged
//! and come back as a [`NotifyOutcome`] for the caller to inspect or ignore.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::config::ChannelNaming;
use crate::order::Order;
use crate::publisher::{ChannelMessage, ChannelPublisher};

pub const NOTIFY_FAILED: &str = "Failed to send notification";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    NewOrder,
    OrderAccepted,
    OrderStatusUpdate,
    VideoDelivered,
    PlatformAnnouncement,
    SystemAlert,
    SubscriptionStarted,
    SubscriptionRenewed,
    SubscriptionCanceled,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewOrder => "new_order",
            Self::OrderAccepted => "order_accepted",
            Self::OrderStatusUpdate => "order_status_update",
            Self::VideoDelivered => "video_delivered",
            Self::PlatformAnnouncement => "platform_announcement",
            Self::SystemAlert => "system_alert",
            Self::SubscriptionStarted => "subscription_started",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::SubscriptionCanceled => "subscription_canceled",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body every channel event carries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub message: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, message: impl Into<String>, data: Value) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            data,
            timestamp: OffsetDateTime::now_utc(),
            severity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotifyOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            error: Some(NOTIFY_FAILED.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn ChannelPublisher>,
    channels: ChannelNaming,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn ChannelPublisher>, channels: ChannelNaming) -> Self {
        Self {
            publisher,
            channels,
        }
    }

    pub fn channels(&self) -> &ChannelNaming {
        &self.channels
    }

    pub async fn notify(
        &self,
        channel: &str,
        event: EventName,
        payload: NotificationPayload,
    ) -> NotifyOutcome {
        let message = ChannelMessage {
            channel: channel.to_string(),
            event: event.as_str().to_string(),
            data: payload,
        };

        match self.publisher.publish(&message).await {
            Ok(()) => NotifyOutcome::ok(),
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    event = %event,
                    error = %e,
                    "Failed to send notification"
                );
                NotifyOutcome::failed()
            }
        }
    }

    pub async fn notify_creator(
        &self,
        creator_id: &str,
        event: EventName,
        title: &str,
        message: &str,
        data: Value,
    ) -> NotifyOutcome {
        let channel = self.channels.creator(creator_id);
        self.notify(&channel, event, NotificationPayload::new(title, message, data))
            .await
    }

    pub async fn notify_fan(
        &self,
        fan_id: &str,
        event: EventName,
        title: &str,
        message: &str,
        data: Value,
    ) -> NotifyOutcome {
        let channel = self.channels.fan(fan_id);
        self.notify(&channel, event, NotificationPayload::new(title, message, data))
            .await
    }

    pub async fn notify_all_creators(&self, title: &str, message: &str, data: Value) -> NotifyOutcome {
        let channel = self.channels.all_creators();
        self.notify(
            &channel,
            EventName::PlatformAnnouncement,
            NotificationPayload::new(title, message, data),
        )
        .await
    }

    /// Log an operational alert at the level matching `severity`; critical
    /// alerts are also published to the admin channel.
    pub async fn system_alert(&self, alert_type: &str, severity: Severity, data: Value) -> NotifyOutcome {
        match severity {
            Severity::Info => tracing::info!(alert_type = %alert_type, data = %data, "System alert"),
            Severity::Warning => tracing::warn!(alert_type = %alert_type, data = %data, "System alert"),
            Severity::Error => tracing::error!(alert_type = %alert_type, data = %data, "System alert"),
            Severity::Critical => tracing::error!(
                alert_type = %alert_type,
                data = %data,
                "CRITICAL system alert"
            ),
        }

        if severity != Severity::Critical {
            return NotifyOutcome::ok();
        }

        let mut payload = NotificationPayload::new(
            format!("Critical alert: {}", alert_type),
            format!("{} requires immediate attention", alert_type),
            json!({ "type": alert_type, "details": data }),
        );
        payload.severity = Some(severity);

        let channel = self.channels.admin_alerts();
        self.notify(&channel, EventName::SystemAlert, payload).await
    }

    pub async fn new_order(&self, order: &Order) -> NotifyOutcome {
        self.notify_creator(
            &order.creator_id,
            EventName::NewOrder,
            "New video request",
            "A fan has paid for a personalized video",
            order_data(order),
        )
        .await
    }

    pub async fn order_accepted(&self, order: &Order) -> NotifyOutcome {
        self.notify_fan(
            &order.fan_id,
            EventName::OrderAccepted,
            "Request accepted",
            "The creator accepted your video request",
            order_data(order),
        )
        .await
    }

    pub async fn order_status_update(&self, order: &Order, message: &str) -> NotifyOutcome {
        self.notify_fan(
            &order.fan_id,
            EventName::OrderStatusUpdate,
            "Order update",
            message,
            order_data(order),
        )
        .await
    }

    pub async fn video_delivered(&self, order: &Order) -> NotifyOutcome {
        self.notify_fan(
            &order.fan_id,
            EventName::VideoDelivered,
            "Your video is ready",
            "The creator delivered your personalized video",
            order_data(order),
        )
        .await
    }
}

fn order_data(order: &Order) -> Value {
    json!({
        "orderId": order.id,
        "paymentIntentId": order.payment_intent_id,
        "creatorId": order.creator_id,
        "fanId": order.fan_id,
        "amount": order.amount,
        "status": order.status,
        "videoUrl": order.video_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::BroadcastHub;
    use crate::testing::{FailingPublisher, RecordingPublisher};

    #[tokio::test]
    async fn test_notify_without_listeners_is_success() {
        let notifier = Notifier::new(Arc::new(BroadcastHub::new()), ChannelNaming::default());
        let outcome = notifier
            .notify_creator("c1", EventName::NewOrder, "t", "m", json!({}))
            .await;
        assert_eq!(outcome, NotifyOutcome::ok());
    }

    #[tokio::test]
    async fn test_publish_failure_is_captured_not_raised() {
        let notifier = Notifier::new(Arc::new(FailingPublisher), ChannelNaming::default());
        let outcome = notifier.notify_fan("f1", EventName::OrderStatusUpdate, "t", "m", json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Failed to send notification"));
    }

    #[tokio::test]
    async fn test_payload_shape() {
        let recorder = Arc::new(RecordingPublisher::new());
        let notifier = Notifier::new(recorder.clone(), ChannelNaming::default());
        notifier
            .notify_all_creators("Maintenance", "Back soon", json!({ "window": "2h" }))
            .await;

        let sent = recorder.messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "all-creators");
        assert_eq!(sent[0].event, "platform_announcement");

        let body = serde_json::to_value(&sent[0]).unwrap();
        for key in ["title", "message", "data", "timestamp"] {
            assert!(body["data"].get(key).is_some(), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_only_critical_alerts_reach_admin_channel() {
        let recorder = Arc::new(RecordingPublisher::new());
        let notifier = Notifier::new(recorder.clone(), ChannelNaming::default());

        for severity in [Severity::Info, Severity::Warning, Severity::Error] {
            assert!(notifier.system_alert("slow_webhook", severity, json!({})).await.success);
        }
        assert!(recorder.messages().await.is_empty());

        notifier
            .system_alert("ledger_mismatch", Severity::Critical, json!({ "pi": "pi_1" }))
            .await;
        let sent = recorder.messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "admin-alerts");
        assert_eq!(sent[0].event, "system_alert");
        assert_eq!(sent[0].data.severity, Some(Severity::Critical));
    }
}
