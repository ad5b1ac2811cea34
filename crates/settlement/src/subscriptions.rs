//! Recurring creator subscriptions
//!
//! A subscription is billed by the gateway on its own schedule; the platform
//! takes its cut as an application-fee percentage and the rest is transferred
//! to the creator's payout account, the same split one-off payments get.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::accounts::AccountValidator;
use crate::client::tagged;
use crate::error::{SettlementError, SettlementResult};
use crate::fees::FeeCalculator;
use crate::gateway::{PaymentGateway, RecurringPriceRequest, SubscriptionRequest};
use crate::ledger::Ledger;
use crate::notifications::{EventName, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(SettlementError::InvalidInput(format!(
                "Unknown billing interval: {}",
                other
            ))),
        }
    }
}

/// Gateway subscription lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incomplete" => Ok(Self::Incomplete),
            "incomplete_expired" => Ok(Self::IncompleteExpired),
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "unpaid" => Ok(Self::Unpaid),
            "paused" => Ok(Self::Paused),
            "canceled" => Ok(Self::Canceled),
            other => Err(SettlementError::InvalidInput(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Gateway subscription id
    pub id: String,
    pub creator_id: String,
    pub payer_id: String,
    pub payout_account_id: String,
    pub tier_name: String,
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub price_id: String,
    pub product_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Creation time of the newest gateway event applied to this row
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Subscription state carried by a lifecycle webhook
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSync {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// When the gateway emitted the event
    pub event_at: OffsetDateTime,
}

impl Subscription {
    /// Apply a lifecycle event; returns `false` when the event is older than
    /// what the row already reflects or would resurrect a canceled row.
    pub fn apply_sync(&mut self, sync: &SubscriptionSync, now: OffsetDateTime) -> bool {
        if self.last_event_at.is_some_and(|last| sync.event_at < last) {
            return false;
        }
        if self.status == SubscriptionStatus::Canceled && sync.status != SubscriptionStatus::Canceled {
            return false;
        }

        self.status = sync.status;
        if let Some(start) = sync.current_period_start {
            self.current_period_start = start;
        }
        if let Some(end) = sync.current_period_end {
            self.current_period_end = end;
        }
        if sync.canceled_at.is_some() {
            self.canceled_at = sync.canceled_at;
        }
        self.cancel_at_period_end = sync.cancel_at_period_end;
        self.last_event_at = Some(sync.event_at);
        self.updated_at = now;
        true
    }

    /// Move the current period forward after a paid renewal; never backwards
    pub fn advance_period(&mut self, start: OffsetDateTime, end: OffsetDateTime, now: OffsetDateTime) -> bool {
        if end <= self.current_period_end {
            return false;
        }
        self.current_period_start = start;
        self.current_period_end = end;
        self.updated_at = now;
        true
    }

    pub fn mark_canceled(&mut self, canceled_at: OffsetDateTime, now: OffsetDateTime) {
        self.status = SubscriptionStatus::Canceled;
        self.canceled_at = Some(canceled_at);
        self.cancel_at_period_end = false;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub creator_id: String,
    pub creator_account_id: String,
    pub payer_id: String,
    /// Payer's customer id at the gateway
    pub payer_customer_id: String,
    pub tier_name: String,
    pub amount: i64,
    pub interval: BillingInterval,
}

/// Subscription billing service
pub struct SubscriptionService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    accounts: AccountValidator,
    fees: FeeCalculator,
    notifier: Notifier,
    currency: String,
    minimum_amount: i64,
}

impl SubscriptionService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        fees: FeeCalculator,
        notifier: Notifier,
        currency: String,
        minimum_amount: i64,
    ) -> Self {
        Self {
            accounts: AccountValidator::new(gateway.clone()),
            gateway,
            ledger,
            fees,
            notifier,
            currency,
            minimum_amount,
        }
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> SettlementResult<Subscription> {
        // Validates the amount is positive
        self.fees.split(request.amount)?;
        if request.amount < self.minimum_amount {
            return Err(SettlementError::InvalidAmount(format!(
                "Amount {} is below the minimum of {}",
                request.amount, self.minimum_amount
            )));
        }
        if request.tier_name.trim().is_empty() {
            return Err(SettlementError::InvalidInput("Tier name is required".to_string()));
        }
        if request.payer_customer_id.trim().is_empty() {
            return Err(SettlementError::InvalidInput(
                "Payer customer id is required".to_string(),
            ));
        }

        let account = self
            .accounts
            .validate(&request.creator_id, &request.creator_account_id)
            .await?;

        let mut metadata = tagged(HashMap::new(), &request.creator_id, &request.payer_id);
        metadata.insert("tier_name".to_string(), request.tier_name.clone());

        let price = self
            .gateway
            .create_recurring_price(RecurringPriceRequest {
                product_name: format!("{} ({})", request.tier_name, request.creator_id),
                unit_amount: request.amount,
                currency: self.currency.clone(),
                interval: request.interval,
                metadata: metadata.clone(),
            })
            .await?;

        let upstream = self
            .gateway
            .create_subscription(SubscriptionRequest {
                customer_id: request.payer_customer_id.clone(),
                price_id: price.price_id.clone(),
                application_fee_percent: self.fees.fee_percent(),
                destination_account: account.account_id.clone(),
                metadata,
            })
            .await?;

        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: upstream.id.clone(),
            creator_id: account.creator_id,
            payer_id: request.payer_id.clone(),
            payout_account_id: account.account_id,
            tier_name: request.tier_name.clone(),
            amount: request.amount,
            currency: self.currency.clone(),
            interval: request.interval,
            status: upstream.status,
            price_id: price.price_id,
            product_id: price.product_id,
            current_period_start: upstream.current_period_start,
            current_period_end: upstream.current_period_end,
            canceled_at: upstream.canceled_at,
            cancel_at_period_end: upstream.cancel_at_period_end,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.ledger.insert_subscription(&subscription).await {
            tracing::error!(
                subscription_id = %subscription.id,
                creator_id = %subscription.creator_id,
                error = %e,
                "RECONCILIATION NEEDED: Subscription exists at the gateway but could not be recorded"
            );
            return Err(e);
        }

        tracing::info!(
            subscription_id = %subscription.id,
            creator_id = %subscription.creator_id,
            tier = %subscription.tier_name,
            amount = subscription.amount,
            interval = %subscription.interval,
            "Created subscription"
        );

        self.notifier
            .notify_creator(
                &subscription.creator_id,
                EventName::SubscriptionStarted,
                "New subscriber",
                &format!("A fan subscribed to {}", subscription.tier_name),
                serde_json::json!({
                    "subscriptionId": subscription.id,
                    "tierName": subscription.tier_name,
                    "amount": subscription.amount,
                    "interval": subscription.interval,
                }),
            )
            .await;

        Ok(subscription)
    }

    /// Cancel upstream and mark the row canceled. Canceling twice is a no-op.
    pub async fn cancel(&self, subscription_id: &str, prorate: bool) -> SettlementResult<Subscription> {
        let existing = self
            .ledger
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| SettlementError::SubscriptionNotFound(subscription_id.to_string()))?;

        if existing.status == SubscriptionStatus::Canceled {
            return Ok(existing);
        }

        let upstream = self.gateway.cancel_subscription(subscription_id, prorate).await?;
        let now = OffsetDateTime::now_utc();
        let canceled_at = upstream.canceled_at.unwrap_or(now);

        let subscription = match self
            .ledger
            .mark_subscription_canceled(subscription_id, canceled_at)
            .await
        {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                return Err(SettlementError::SubscriptionNotFound(subscription_id.to_string()))
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "RECONCILIATION NEEDED: Subscription canceled at the gateway but not in the ledger"
                );
                return Err(e);
            }
        };

        tracing::info!(
            subscription_id = %subscription_id,
            prorate = prorate,
            "Cancelled subscription"
        );

        self.notifier
            .notify_creator(
                &subscription.creator_id,
                EventName::SubscriptionCanceled,
                "Subscription canceled",
                &format!("A subscription to {} was canceled", subscription.tier_name),
                serde_json::json!({ "subscriptionId": subscription.id }),
            )
            .await;

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn subscription(now: OffsetDateTime) -> Subscription {
        Subscription {
            id: "sub_1".to_string(),
            creator_id: "creator_1".to_string(),
            payer_id: "fan_1".to_string(),
            payout_account_id: "acct_1".to_string(),
            tier_name: "Gold".to_string(),
            amount: 999,
            currency: "usd".to_string(),
            interval: BillingInterval::Month,
            status: SubscriptionStatus::Incomplete,
            price_id: "price_1".to_string(),
            product_id: "prod_1".to_string(),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            canceled_at: None,
            cancel_at_period_end: false,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sync(status: SubscriptionStatus, event_at: OffsetDateTime) -> SubscriptionSync {
        SubscriptionSync {
            subscription_id: "sub_1".to_string(),
            status,
            current_period_start: None,
            current_period_end: None,
            canceled_at: None,
            cancel_at_period_end: false,
            event_at,
        }
    }

    #[test]
    fn test_older_event_does_not_overwrite_newer() {
        let now = OffsetDateTime::now_utc();
        let mut sub = subscription(now);

        assert!(sub.apply_sync(&sync(SubscriptionStatus::PastDue, now), now));
        assert!(!sub.apply_sync(&sync(SubscriptionStatus::Active, now - Duration::minutes(5)), now));
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_canceled_is_terminal() {
        let now = OffsetDateTime::now_utc();
        let mut sub = subscription(now);
        sub.mark_canceled(now, now);

        assert!(!sub.apply_sync(&sync(SubscriptionStatus::Active, now + Duration::minutes(1)), now));
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        // Repeating the cancellation is fine
        assert!(sub.apply_sync(&sync(SubscriptionStatus::Canceled, now + Duration::minutes(2)), now));
    }

    #[test]
    fn test_period_never_moves_backwards() {
        let now = OffsetDateTime::now_utc();
        let mut sub = subscription(now);
        let next_start = now + Duration::days(30);
        let next_end = now + Duration::days(60);

        assert!(sub.advance_period(next_start, next_end, now));
        assert!(!sub.advance_period(now, now + Duration::days(30), now));
        assert_eq!(sub.current_period_end, next_end);
    }

    #[test]
    fn test_interval_and_status_parse() {
        assert_eq!("year".parse::<BillingInterval>().unwrap(), BillingInterval::Year);
        assert!("fortnight".parse::<BillingInterval>().is_err());
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
    }
}
