//! Video orders
//!
//! An order exists once a video payment has completed. The creator then
//! accepts or declines it, and an accepted order ends with a delivered video.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};
use crate::ledger::Ledger;
use crate::notifications::Notifier;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Delivered,
    Declined,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Delivered => "delivered",
            Self::Declined => "declined",
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Accepted)
                | (Self::Pending, Self::Declined)
                | (Self::Accepted, Self::Delivered)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "delivered" => Ok(Self::Delivered),
            "declined" => Ok(Self::Declined),
            other => Err(SettlementError::InvalidInput(format!(
                "Unknown order status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub payment_intent_id: String,
    pub creator_id: String,
    pub fan_id: String,
    pub amount: i64,
    pub status: OrderStatus,
    /// What the fan asked for, copied from the payment's metadata
    pub metadata: HashMap<String, String>,
    pub video_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Order {
    /// Order for a video payment that just completed
    pub fn for_payment(transaction: &Transaction, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_intent_id: transaction.payment_intent_id.clone(),
            creator_id: transaction.creator_id.clone(),
            fan_id: transaction.payer_id.clone(),
            amount: transaction.gross_amount,
            status: OrderStatus::Pending,
            metadata: transaction.metadata.clone(),
            video_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Compare-and-set status change for an order row
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: Uuid,
    pub expected: OrderStatus,
    pub next: OrderStatus,
    pub video_url: Option<String>,
    pub updated_at: OffsetDateTime,
}

pub struct OrderService {
    ledger: Arc<dyn Ledger>,
    notifier: Notifier,
}

impl OrderService {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Notifier) -> Self {
        Self { ledger, notifier }
    }

    pub async fn get(&self, order_id: Uuid) -> SettlementResult<Order> {
        self.ledger
            .find_order(order_id)
            .await?
            .ok_or_else(|| SettlementError::OrderNotFound(order_id.to_string()))
    }

    pub async fn accept(&self, order_id: Uuid) -> SettlementResult<Order> {
        let order = self.advance(order_id, OrderStatus::Accepted, None).await?;
        self.notifier.order_accepted(&order).await;
        Ok(order)
    }

    pub async fn deliver(&self, order_id: Uuid, video_url: &str) -> SettlementResult<Order> {
        let video_url = video_url.trim();
        if !(video_url.starts_with("https://") || video_url.starts_with("http://")) {
            return Err(SettlementError::InvalidInput(
                "Video URL must be an http(s) URL".to_string(),
            ));
        }

        let order = self
            .advance(order_id, OrderStatus::Delivered, Some(video_url.to_string()))
            .await?;
        self.notifier.video_delivered(&order).await;
        Ok(order)
    }

    pub async fn decline(&self, order_id: Uuid) -> SettlementResult<Order> {
        let order = self.advance(order_id, OrderStatus::Declined, None).await?;
        self.notifier
            .order_status_update(&order, "Your request was declined by the creator")
            .await;
        Ok(order)
    }

    async fn advance(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        video_url: Option<String>,
    ) -> SettlementResult<Order> {
        let current = self.get(order_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(SettlementError::illegal(current.status, next));
        }

        let updated = self
            .ledger
            .update_order(&OrderUpdate {
                order_id,
                expected: current.status,
                next,
                video_url,
                updated_at: OffsetDateTime::now_utc(),
            })
            .await?;

        match updated {
            Some(order) => {
                tracing::info!(
                    order_id = %order.id,
                    creator_id = %order.creator_id,
                    from = %current.status,
                    to = %order.status,
                    "Order status changed"
                );
                Ok(order)
            }
            // Someone else moved the order between our read and write
            None => {
                let latest = self.get(order_id).await?;
                Err(SettlementError::illegal(latest.status, next))
            }
        }
    }
}
