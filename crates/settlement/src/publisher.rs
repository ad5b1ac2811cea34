//! Channel publishers
//!
//! [`HttpChannelPublisher`] hands events to the external pub/sub service;
//! [`BroadcastHub`] keeps them in-process and serves them to subscribers
//! directly (the api crate streams a hub channel as Server-Sent Events).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::{broadcast, RwLock};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::config::PubSubConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::notifications::NotificationPayload;

type HmacSha256 = Hmac<Sha256>;

/// Buffered events per hub channel before slow subscribers start lagging
const CHANNEL_BUFFER_SIZE: usize = 256;

/// One event addressed to one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub event: String,
    pub data: NotificationPayload,
}

#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    async fn publish(&self, message: &ChannelMessage) -> SettlementResult<()>;
}

/// Publishes through the pub/sub service's REST endpoint.
///
/// Bodies are signed with HMAC-SHA256 over the raw JSON in `X-Signature`.
/// Transient failures are retried a few times with jittered backoff.
pub struct HttpChannelPublisher {
    client: reqwest::Client,
    config: PubSubConfig,
}

impl HttpChannelPublisher {
    pub fn new(config: PubSubConfig) -> SettlementResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SettlementError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn sign(&self, body: &[u8]) -> SettlementResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .map_err(|e| SettlementError::Config(format!("Invalid pub/sub secret: {}", e)))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl ChannelPublisher for HttpChannelPublisher {
    async fn publish(&self, message: &ChannelMessage) -> SettlementResult<()> {
        let body = serde_json::to_vec(message)
            .map_err(|e| SettlementError::Publish(format!("Failed to encode event: {}", e)))?;
        let signature = self.sign(&body)?;

        let client = &self.client;
        let url = self.config.url.as_str();
        let signature = signature.as_str();
        let body = body.as_slice();

        let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);
        Retry::spawn(strategy, move || async move {
            let response = client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Signature", signature)
                .body(body.to_vec())
                .send()
                .await?;
            response.error_for_status().map(|_| ())
        })
        .await
        .map_err(|e| {
            SettlementError::Publish(format!(
                "Failed to publish {} to {}: {}",
                message.event, message.channel, e
            ))
        })
    }
}

/// In-process fan-out: one broadcast channel per channel name.
///
/// Only subscribing creates a channel. Channels whose last receiver is gone
/// are dropped on the next publish, subscribe or [`BroadcastHub::release`].
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ChannelMessage>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER_SIZE).0)
            .subscribe()
    }

    /// Drop `channel` if nobody listens to it any more
    pub async fn release(&self, channel: &str) {
        let mut channels = self.channels.write().await;
        if channels
            .get(channel)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(channel);
            tracing::debug!(channel = %channel, "Released idle hub channel");
        }
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[async_trait]
impl ChannelPublisher for BroadcastHub {
    async fn publish(&self, message: &ChannelMessage) -> SettlementResult<()> {
        let sent = match self.channels.read().await.get(&message.channel) {
            Some(tx) => tx.send(message.clone()),
            None => Ok(0),
        };

        // No listeners is not a failure; the event simply has nobody to reach
        let delivered = match sent {
            Ok(delivered) => delivered,
            Err(_) => {
                self.release(&message.channel).await;
                0
            }
        };
        tracing::debug!(
            channel = %message.channel,
            event = %message.event,
            subscribers = delivered,
            "Published to hub channel"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn message(channel: &str) -> ChannelMessage {
        ChannelMessage {
            channel: channel.to_string(),
            event: "new_order".to_string(),
            data: NotificationPayload {
                title: "New order".to_string(),
                message: "You have a new request".to_string(),
                data: serde_json::json!({ "amount": 10000 }),
                timestamp: OffsetDateTime::now_utc(),
                severity: None,
            },
        }
    }

    #[tokio::test]
    async fn test_publish_without_listeners_succeeds() {
        let hub = BroadcastHub::new();
        assert!(hub.publish(&message("creator-nobody")).await.is_ok());
        assert_eq!(hub.subscriber_count("creator-nobody").await, 0);
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_channels_dropped_after_last_subscriber_leaves() {
        let hub = BroadcastHub::new();
        let rx = hub.subscribe("fan-1").await;
        let kept = hub.subscribe("fan-2").await;
        assert_eq!(hub.channel_count().await, 2);

        drop(rx);
        hub.publish(&message("fan-1")).await.unwrap();
        assert_eq!(hub.channel_count().await, 1);

        let other = hub.subscribe("fan-3").await;
        drop(other);
        hub.release("fan-3").await;
        // A listener still attached keeps its channel
        hub.release("fan-2").await;
        assert_eq!(hub.channel_count().await, 1);
        assert_eq!(hub.subscriber_count("fan-2").await, 1);
        drop(kept);

        // Many short-lived channels do not accumulate
        for i in 0..100 {
            let rx = hub.subscribe(&format!("fan-churn-{}", i)).await;
            drop(rx);
        }
        let _last = hub.subscribe("fan-last").await;
        assert_eq!(hub.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_only_its_channel() {
        let hub = BroadcastHub::new();
        let mut rx = hub.subscribe("creator-1").await;

        hub.publish(&message("creator-2")).await.unwrap();
        hub.publish(&message("creator-1")).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "creator-1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_signature_is_hex_hmac() {
        let publisher = HttpChannelPublisher::new(PubSubConfig {
            url: "http://localhost:9999/events".to_string(),
            secret: "pubsub_secret".to_string(),
        })
        .unwrap();

        let signature = publisher.sign(b"{}").unwrap();
        assert_eq!(signature.len(), 64);

        let mut mac = HmacSha256::new_from_slice(b"pubsub_secret").unwrap();
        mac.update(b"{}");
        assert!(mac.verify_slice(&hex::decode(&signature).unwrap()).is_ok());
    }
}
