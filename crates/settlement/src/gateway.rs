//! Payment gateway port
//!
//! Everything the settlement core asks of the external gateway. The Stripe
//! adapter lives in [`crate::client`]; tests script a mock (see `testing`).

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::SettlementResult;
use crate::refund::RefundReason;
use crate::subscriptions::{BillingInterval, SubscriptionStatus};

/// Connected (payout) account state as the gateway reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAccount {
    pub id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

/// Destination charge: the full amount is transferred to `destination_account`
/// and `application_fee_amount` is kept by the platform
#[derive(Debug, Clone)]
pub struct PaymentIntentRequest {
    pub amount: i64,
    pub currency: String,
    pub application_fee_amount: i64,
    pub destination_account: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreatedPaymentIntent {
    pub id: String,
    pub client_secret: String,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_intent_id: String,
    pub amount: i64,
    pub reason: RefundReason,
    pub reverse_transfer: bool,
    pub refund_application_fee: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct GatewayRefund {
    pub id: String,
    pub amount: i64,
    /// Gateway-reported status, e.g. `succeeded` or `pending`
    pub status: String,
}

/// Product plus recurring price for one subscription tier
#[derive(Debug, Clone)]
pub struct RecurringPriceRequest {
    pub product_name: String,
    pub unit_amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RecurringPrice {
    pub product_id: String,
    pub price_id: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub application_fee_percent: f64,
    pub destination_account: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct GatewaySubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// `Ok(None)` when the gateway has no such account
    async fn retrieve_account(&self, account_id: &str) -> SettlementResult<Option<GatewayAccount>>;

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> SettlementResult<CreatedPaymentIntent>;

    async fn create_refund(&self, request: RefundRequest) -> SettlementResult<GatewayRefund>;

    async fn create_recurring_price(
        &self,
        request: RecurringPriceRequest,
    ) -> SettlementResult<RecurringPrice>;

    async fn create_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> SettlementResult<GatewaySubscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prorate: bool,
    ) -> SettlementResult<GatewaySubscription>;
}
