//! Durable ledger port
//!
//! The transaction row is the single source of truth for money state. Every
//! webhook is applied as one atomic unit: the processed-event claim and the
//! state mutation commit together or not at all, which is what makes
//! duplicated and concurrent deliveries collapse to a single transition.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};
use crate::fees::FeeSplit;
use crate::order::{Order, OrderUpdate};
use crate::subscriptions::{Subscription, SubscriptionStatus, SubscriptionSync};
use crate::transaction::{Transaction, TransactionStatus};

/// Processed webhook event, kept for deduplication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRecord {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: OffsetDateTime,
}

/// A paid subscription invoice
#[derive(Debug, Clone)]
pub struct InvoicePayment {
    pub invoice_id: String,
    pub subscription_id: String,
    /// Ledger key for the resulting transaction
    pub payment_intent_id: String,
    pub split: FeeSplit,
    pub currency: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
}

/// State mutation requested by a verified webhook event
#[derive(Debug, Clone)]
pub enum LedgerChange {
    /// Drive a payment's transaction toward `target`
    PaymentStatus {
        payment_intent_id: String,
        target: TransactionStatus,
    },
    InvoicePaid(InvoicePayment),
    SubscriptionSync(SubscriptionSync),
    /// Claim the event id only
    RecordOnly,
}

#[derive(Debug, Clone)]
pub enum WebhookApplication {
    /// Event id already processed; nothing was touched
    Duplicate,
    Applied(AppliedChange),
}

#[derive(Debug, Clone)]
pub enum AppliedChange {
    PaymentTransitioned {
        transaction: Transaction,
        previous: TransactionStatus,
        /// Created alongside a completed video payment
        order: Option<Order>,
    },
    PaymentAlreadyApplied(Transaction),
    /// Recorded, but the event contradicts the row
    PaymentIllegal {
        transaction: Transaction,
        target: TransactionStatus,
    },
    InvoiceRecorded {
        transaction: Transaction,
        subscription: Subscription,
        /// `false` when the invoice's transaction already existed
        created: bool,
    },
    SubscriptionSynced {
        subscription: Subscription,
        previous: SubscriptionStatus,
    },
    /// Older than what the row already reflects
    SubscriptionStale(Subscription),
    Recorded,
}

/// Compare-and-set refund write, keyed on the cumulative refunded amount read
/// before the gateway call
#[derive(Debug, Clone)]
pub struct RefundUpdate {
    pub payment_intent_id: String,
    pub expected_refunded: i64,
    pub refunded_amount: i64,
    pub refunded_fee: i64,
    pub transfer_reversed: i64,
    pub status: TransactionStatus,
    pub refunded_at: OffsetDateTime,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert_transaction(&self, transaction: &Transaction) -> SettlementResult<()>;

    async fn find_transaction(&self, payment_intent_id: &str) -> SettlementResult<Option<Transaction>>;

    /// Claim `record.event_id` and apply `change` atomically.
    ///
    /// Returns [`WebhookApplication::Duplicate`] without touching anything if the
    /// id is already claimed. On error nothing is recorded, so the gateway's
    /// redelivery gets another attempt.
    async fn apply_webhook(
        &self,
        record: &WebhookRecord,
        change: LedgerChange,
    ) -> SettlementResult<WebhookApplication>;

    /// `Ok(None)` when the row moved since it was read
    async fn apply_refund(&self, update: &RefundUpdate) -> SettlementResult<Option<Transaction>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> SettlementResult<()>;

    async fn find_subscription(&self, subscription_id: &str) -> SettlementResult<Option<Subscription>>;

    async fn mark_subscription_canceled(
        &self,
        subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> SettlementResult<Option<Subscription>>;

    async fn find_order(&self, order_id: Uuid) -> SettlementResult<Option<Order>>;

    /// `Ok(None)` when the order is no longer in `update.expected`
    async fn update_order(&self, update: &OrderUpdate) -> SettlementResult<Option<Order>>;

    /// Completed transactions for a creator created in `[start, end)`
    async fn completed_transactions(
        &self,
        creator_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> SettlementResult<Vec<Transaction>>;

    async fn transactions_updated_since(&self, since: OffsetDateTime) -> SettlementResult<Vec<Transaction>>;

    /// Payment intent ids of completed video transactions that have no order
    async fn completed_videos_without_order(&self, since: OffsetDateTime) -> SettlementResult<Vec<String>>;

    /// Drop processed-event records older than `before`
    async fn prune_webhook_records(&self, before: OffsetDateTime) -> SettlementResult<u64>;

    async fn health_check(&self) -> SettlementResult<()>;
}

/// Build the transaction for a paid subscription invoice.
///
/// Shared by both ledger implementations so they agree on the rules.
pub(crate) fn invoice_transaction(
    payment: &InvoicePayment,
    subscription: &Subscription,
    now: OffsetDateTime,
) -> Transaction {
    use std::collections::HashMap;

    use crate::transaction::{NewTransaction, TransactionType};

    let mut metadata = HashMap::new();
    metadata.insert("invoice_id".to_string(), payment.invoice_id.clone());
    metadata.insert("subscription_id".to_string(), subscription.id.clone());
    metadata.insert("tier_name".to_string(), subscription.tier_name.clone());

    Transaction::new(
        NewTransaction {
            payment_intent_id: payment.payment_intent_id.clone(),
            creator_id: subscription.creator_id.clone(),
            payer_id: subscription.payer_id.clone(),
            payout_account_id: subscription.payout_account_id.clone(),
            currency: payment.currency.clone(),
            transaction_type: TransactionType::Subscription,
            metadata,
        },
        payment.split,
        TransactionStatus::Completed,
        now,
    )
}

pub(crate) fn unknown_payment(payment_intent_id: &str) -> SettlementError {
    SettlementError::ConsistencyFault(format!(
        "Webhook references unknown payment intent {}",
        payment_intent_id
    ))
}

pub(crate) fn unknown_subscription(subscription_id: &str) -> SettlementError {
    SettlementError::ConsistencyFault(format!(
        "Webhook references unknown subscription {}",
        subscription_id
    ))
}
