//! Test doubles for the gateway and publisher seams
//!
//! Compiled for this crate's tests and, through the `test-util` feature, for
//! downstream crates' tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{SettlementError, SettlementResult};
use crate::fees::FeeCalculator;
use crate::gateway::{
    CreatedPaymentIntent, GatewayAccount, GatewayRefund, GatewaySubscription, PaymentGateway,
    PaymentIntentRequest, RecurringPrice, RecurringPriceRequest, RefundRequest,
    SubscriptionRequest,
};
use crate::publisher::{ChannelMessage, ChannelPublisher};
use crate::subscriptions::SubscriptionStatus;
use crate::transaction::{NewTransaction, Transaction, TransactionStatus, TransactionType};
use crate::webhooks::compute_signature;

#[derive(Default)]
struct GatewayState {
    accounts: HashMap<String, GatewayAccount>,
    failures: VecDeque<String>,
    payment_intents: Vec<PaymentIntentRequest>,
    refunds: Vec<RefundRequest>,
    prices: Vec<RecurringPriceRequest>,
    subscriptions: Vec<SubscriptionRequest>,
    canceled: Vec<(String, bool)>,
}

/// Scriptable in-memory gateway that records every request it receives
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<GatewayState>,
    sequence: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a connected account
    pub async fn add_account(&self, account_id: &str, charges_enabled: bool, payouts_enabled: bool) {
        self.state.lock().await.accounts.insert(
            account_id.to_string(),
            GatewayAccount {
                id: account_id.to_string(),
                charges_enabled,
                payouts_enabled,
            },
        );
    }

    /// Make the next mutating gateway call fail with `message`
    pub async fn fail_next(&self, message: &str) {
        self.state.lock().await.failures.push_back(message.to_string());
    }

    pub async fn payment_intents(&self) -> Vec<PaymentIntentRequest> {
        self.state.lock().await.payment_intents.clone()
    }

    pub async fn refund_requests(&self) -> Vec<RefundRequest> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn price_requests(&self) -> Vec<RecurringPriceRequest> {
        self.state.lock().await.prices.clone()
    }

    pub async fn subscription_requests(&self) -> Vec<SubscriptionRequest> {
        self.state.lock().await.subscriptions.clone()
    }

    /// `(subscription_id, prorate)` for every cancellation
    pub async fn cancellations(&self) -> Vec<(String, bool)> {
        self.state.lock().await.canceled.clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_mock{}", prefix, self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn scripted_failure(state: &mut GatewayState) -> SettlementResult<()> {
        match state.failures.pop_front() {
            Some(message) => Err(SettlementError::Gateway(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn retrieve_account(&self, account_id: &str) -> SettlementResult<Option<GatewayAccount>> {
        Ok(self.state.lock().await.accounts.get(account_id).cloned())
    }

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> SettlementResult<CreatedPaymentIntent> {
        let mut state = self.state.lock().await;
        Self::scripted_failure(&mut state)?;

        let id = self.next_id("pi");
        let amount = request.amount;
        state.payment_intents.push(request);
        Ok(CreatedPaymentIntent {
            client_secret: format!("{}_secret", id),
            id,
            amount,
        })
    }

    async fn create_refund(&self, request: RefundRequest) -> SettlementResult<GatewayRefund> {
        let mut state = self.state.lock().await;
        Self::scripted_failure(&mut state)?;

        let amount = request.amount;
        state.refunds.push(request);
        Ok(GatewayRefund {
            id: self.next_id("re"),
            amount,
            status: "succeeded".to_string(),
        })
    }

    async fn create_recurring_price(
        &self,
        request: RecurringPriceRequest,
    ) -> SettlementResult<RecurringPrice> {
        let mut state = self.state.lock().await;
        Self::scripted_failure(&mut state)?;

        state.prices.push(request);
        Ok(RecurringPrice {
            product_id: self.next_id("prod"),
            price_id: self.next_id("price"),
        })
    }

    async fn create_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> SettlementResult<GatewaySubscription> {
        let mut state = self.state.lock().await;
        Self::scripted_failure(&mut state)?;

        state.subscriptions.push(request);
        let now = OffsetDateTime::now_utc();
        Ok(GatewaySubscription {
            id: self.next_id("sub"),
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            canceled_at: None,
            cancel_at_period_end: false,
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prorate: bool,
    ) -> SettlementResult<GatewaySubscription> {
        let mut state = self.state.lock().await;
        Self::scripted_failure(&mut state)?;

        state.canceled.push((subscription_id.to_string(), prorate));
        let now = OffsetDateTime::now_utc();
        Ok(GatewaySubscription {
            id: subscription_id.to_string(),
            status: SubscriptionStatus::Canceled,
            current_period_start: now - Duration::days(1),
            current_period_end: now + Duration::days(29),
            canceled_at: Some(now),
            cancel_at_period_end: false,
        })
    }
}

/// Keeps every published message
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<ChannelMessage>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<ChannelMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn events_on(&self, channel: &str) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.event.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelPublisher for RecordingPublisher {
    async fn publish(&self, message: &ChannelMessage) -> SettlementResult<()> {
        self.messages.lock().await.push(message.clone());
        Ok(())
    }
}

/// Rejects every publish
pub struct FailingPublisher;

#[async_trait]
impl ChannelPublisher for FailingPublisher {
    async fn publish(&self, _message: &ChannelMessage) -> SettlementResult<()> {
        Err(SettlementError::Publish("pub/sub unavailable".to_string()))
    }
}

/// A video transaction for `creator_1` paid by `fan_1` through `acct_1`
pub fn video_transaction(payment_intent_id: &str, amount: i64, status: TransactionStatus) -> Transaction {
    let split = FeeCalculator::default()
        .split(amount)
        .unwrap_or_else(|e| panic!("invalid test amount {}: {}", amount, e));
    Transaction::new(
        NewTransaction {
            payment_intent_id: payment_intent_id.to_string(),
            creator_id: "creator_1".to_string(),
            payer_id: "fan_1".to_string(),
            payout_account_id: "acct_1".to_string(),
            currency: "usd".to_string(),
            transaction_type: TransactionType::Video,
            metadata: HashMap::new(),
        },
        split,
        status,
        OffsetDateTime::now_utc(),
    )
}

pub fn completed_video(payment_intent_id: &str, amount: i64) -> Transaction {
    video_transaction(payment_intent_id, amount, TransactionStatus::Completed)
}

pub fn pending_video(payment_intent_id: &str, amount: i64) -> Transaction {
    video_transaction(payment_intent_id, amount, TransactionStatus::Pending)
}

/// Payment intent object as the gateway sends it for a video payment by
/// `fan_1` to `creator_1`
pub fn video_intent(payment_intent_id: &str, amount: i64) -> serde_json::Value {
    json!({
        "id": payment_intent_id,
        "amount": amount,
        "metadata": {
            "creator_id": "creator_1",
            "payer_id": "fan_1",
            "transaction_type": "video"
        }
    })
}

/// Raw gateway event body
pub fn event_payload(event_id: &str, event_type: &str, created: i64, object: serde_json::Value) -> String {
    json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": { "object": object }
    })
    .to_string()
}

/// A valid `Stripe-Signature` header for `payload`, signed now
pub fn signature_header(secret: &str, payload: &str) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let signature = compute_signature(secret, timestamp, payload)
        .unwrap_or_else(|e| panic!("failed to sign test payload: {}", e));
    format!("t={},v1={}", timestamp, signature)
}
