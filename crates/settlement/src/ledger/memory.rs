//! In-process ledger
//!
//! Backs local development when no database is configured, and the test
//! suites. A single mutex over the whole state gives every webhook the same
//! all-or-nothing behaviour the Postgres transaction provides.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    invoice_transaction, unknown_payment, unknown_subscription, AppliedChange, InvoicePayment,
    Ledger, LedgerChange, RefundUpdate, WebhookApplication, WebhookRecord,
};
use crate::error::{SettlementError, SettlementResult};
use crate::order::{Order, OrderUpdate};
use crate::subscriptions::{Subscription, SubscriptionSync};
use crate::transaction::{resolve, Resolution, Transaction, TransactionStatus, TransactionType};

#[derive(Default)]
struct State {
    transactions: HashMap<String, Transaction>,
    subscriptions: HashMap<String, Subscription>,
    orders: HashMap<Uuid, Order>,
    processed: HashMap<String, WebhookRecord>,
}

impl State {
    fn order_for_payment(&self, payment_intent_id: &str) -> Option<&Order> {
        self.orders
            .values()
            .find(|o| o.payment_intent_id == payment_intent_id)
    }

    fn apply_payment_status(
        &mut self,
        payment_intent_id: &str,
        target: TransactionStatus,
        now: OffsetDateTime,
    ) -> SettlementResult<AppliedChange> {
        let mut transaction = self
            .transactions
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| unknown_payment(payment_intent_id))?;

        match resolve(transaction.status, target) {
            Resolution::AlreadyApplied => Ok(AppliedChange::PaymentAlreadyApplied(transaction)),
            Resolution::Illegal => Ok(AppliedChange::PaymentIllegal { transaction, target }),
            Resolution::Apply => {
                let previous = transaction.status;
                transaction.transition(target, now)?;

                let order = if target == TransactionStatus::Completed
                    && transaction.transaction_type == TransactionType::Video
                    && self.order_for_payment(payment_intent_id).is_none()
                {
                    let order = Order::for_payment(&transaction, now);
                    self.orders.insert(order.id, order.clone());
                    Some(order)
                } else {
                    None
                };

                self.transactions
                    .insert(payment_intent_id.to_string(), transaction.clone());

                Ok(AppliedChange::PaymentTransitioned {
                    transaction,
                    previous,
                    order,
                })
            }
        }
    }

    fn apply_invoice(
        &mut self,
        payment: &InvoicePayment,
        now: OffsetDateTime,
    ) -> SettlementResult<AppliedChange> {
        let mut subscription = self
            .subscriptions
            .get(&payment.subscription_id)
            .cloned()
            .ok_or_else(|| unknown_subscription(&payment.subscription_id))?;

        let (transaction, created) = match self.transactions.get(&payment.payment_intent_id) {
            Some(existing) => (existing.clone(), false),
            None => {
                let transaction = invoice_transaction(payment, &subscription, now);
                self.transactions
                    .insert(transaction.payment_intent_id.clone(), transaction.clone());
                (transaction, true)
            }
        };

        if let (Some(start), Some(end)) = (payment.period_start, payment.period_end) {
            if subscription.advance_period(start, end, now) {
                self.subscriptions
                    .insert(subscription.id.clone(), subscription.clone());
            }
        }

        Ok(AppliedChange::InvoiceRecorded {
            transaction,
            subscription,
            created,
        })
    }

    fn apply_subscription_sync(
        &mut self,
        sync: &SubscriptionSync,
        now: OffsetDateTime,
    ) -> SettlementResult<AppliedChange> {
        let mut subscription = self
            .subscriptions
            .get(&sync.subscription_id)
            .cloned()
            .ok_or_else(|| unknown_subscription(&sync.subscription_id))?;

        let previous = subscription.status;
        if !subscription.apply_sync(sync, now) {
            return Ok(AppliedChange::SubscriptionStale(subscription));
        }
        self.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(AppliedChange::SubscriptionSynced {
            subscription,
            previous,
        })
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn processed_event_ids(&self) -> Vec<String> {
        self.state.lock().await.processed.keys().cloned().collect()
    }

    pub async fn order_for_payment(&self, payment_intent_id: &str) -> Option<Order> {
        self.state
            .lock()
            .await
            .order_for_payment(payment_intent_id)
            .cloned()
    }

    /// Overwrite a stored transaction as-is, bypassing the state machine
    pub async fn put_transaction(&self, transaction: Transaction) {
        self.state
            .lock()
            .await
            .transactions
            .insert(transaction.payment_intent_id.clone(), transaction);
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_transaction(&self, transaction: &Transaction) -> SettlementResult<()> {
        let mut state = self.state.lock().await;
        if state.transactions.contains_key(&transaction.payment_intent_id) {
            return Err(SettlementError::ConsistencyFault(format!(
                "Transaction for payment intent {} already exists",
                transaction.payment_intent_id
            )));
        }
        state
            .transactions
            .insert(transaction.payment_intent_id.clone(), transaction.clone());
        Ok(())
    }

    async fn find_transaction(&self, payment_intent_id: &str) -> SettlementResult<Option<Transaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .get(payment_intent_id)
            .cloned())
    }

    async fn apply_webhook(
        &self,
        record: &WebhookRecord,
        change: LedgerChange,
    ) -> SettlementResult<WebhookApplication> {
        let mut state = self.state.lock().await;
        if state.processed.contains_key(&record.event_id) {
            return Ok(WebhookApplication::Duplicate);
        }

        let now = record.processed_at;
        // Each arm either fails before mutating or succeeds completely
        let applied = match change {
            LedgerChange::PaymentStatus {
                payment_intent_id,
                target,
            } => state.apply_payment_status(&payment_intent_id, target, now)?,
            LedgerChange::InvoicePaid(payment) => state.apply_invoice(&payment, now)?,
            LedgerChange::SubscriptionSync(sync) => state.apply_subscription_sync(&sync, now)?,
            LedgerChange::RecordOnly => AppliedChange::Recorded,
        };

        state
            .processed
            .insert(record.event_id.clone(), record.clone());
        Ok(WebhookApplication::Applied(applied))
    }

    async fn apply_refund(&self, update: &RefundUpdate) -> SettlementResult<Option<Transaction>> {
        let mut state = self.state.lock().await;
        let Some(transaction) = state.transactions.get_mut(&update.payment_intent_id) else {
            return Ok(None);
        };

        if !transaction.status.is_refundable()
            || transaction.refunded_total() != update.expected_refunded
        {
            return Ok(None);
        }
        transaction.transition(update.status, update.refunded_at)?;
        transaction.refunded_amount = Some(update.refunded_amount);
        transaction.refunded_fee = update.refunded_fee;
        transaction.transfer_reversed = update.transfer_reversed;
        transaction.refunded_at = Some(update.refunded_at);
        Ok(Some(transaction.clone()))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> SettlementResult<()> {
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(SettlementError::ConsistencyFault(format!(
                "Subscription {} already exists",
                subscription.id
            )));
        }
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn find_subscription(&self, subscription_id: &str) -> SettlementResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned())
    }

    async fn mark_subscription_canceled(
        &self,
        subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> SettlementResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.subscriptions.get_mut(subscription_id).map(|subscription| {
            subscription.mark_canceled(canceled_at, OffsetDateTime::now_utc());
            subscription.clone()
        }))
    }

    async fn find_order(&self, order_id: Uuid) -> SettlementResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn update_order(&self, update: &OrderUpdate) -> SettlementResult<Option<Order>> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&update.order_id) else {
            return Ok(None);
        };
        if order.status != update.expected {
            return Ok(None);
        }
        order.status = update.next;
        if update.video_url.is_some() {
            order.video_url = update.video_url.clone();
        }
        order.updated_at = update.updated_at;
        Ok(Some(order.clone()))
    }

    async fn completed_transactions(
        &self,
        creator_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> SettlementResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut transactions: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                t.creator_id == creator_id
                    && t.status == TransactionStatus::Completed
                    && t.created_at >= start
                    && t.created_at < end
            })
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.created_at);
        Ok(transactions)
    }

    async fn transactions_updated_since(&self, since: OffsetDateTime) -> SettlementResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.updated_at >= since)
            .cloned()
            .collect())
    }

    async fn completed_videos_without_order(&self, since: OffsetDateTime) -> SettlementResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| {
                t.transaction_type == TransactionType::Video
                    && t.status.is_settled()
                    && t.updated_at >= since
                    && state.order_for_payment(&t.payment_intent_id).is_none()
            })
            .map(|t| t.payment_intent_id.clone())
            .collect())
    }

    async fn prune_webhook_records(&self, before: OffsetDateTime) -> SettlementResult<u64> {
        let mut state = self.state.lock().await;
        let len = state.processed.len();
        state.processed.retain(|_, r| r.processed_at >= before);
        Ok((len - state.processed.len()) as u64)
    }

    async fn health_check(&self) -> SettlementResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeCalculator;
    use crate::transaction::NewTransaction;
    use time::Duration;

    fn pending(payment_intent_id: &str) -> Transaction {
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
            FeeCalculator::default().split(10_000).unwrap(),
            TransactionStatus::Pending,
            OffsetDateTime::now_utc(),
        )
    }

    fn record(event_id: &str) -> WebhookRecord {
        WebhookRecord {
            event_id: event_id.to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            processed_at: OffsetDateTime::now_utc(),
        }
    }

    fn succeed(pi: &str) -> LedgerChange {
        LedgerChange::PaymentStatus {
            payment_intent_id: pi.to_string(),
            target: TransactionStatus::Completed,
        }
    }

    #[tokio::test]
    async fn test_duplicate_event_is_skipped() {
        let ledger = MemoryLedger::new();
        ledger.insert_transaction(&pending("pi_1")).await.unwrap();

        let first = ledger.apply_webhook(&record("evt_1"), succeed("pi_1")).await.unwrap();
        assert!(matches!(
            first,
            WebhookApplication::Applied(AppliedChange::PaymentTransitioned { order: Some(_), .. })
        ));

        let second = ledger.apply_webhook(&record("evt_1"), succeed("pi_1")).await.unwrap();
        assert!(matches!(second, WebhookApplication::Duplicate));
    }

    #[tokio::test]
    async fn test_unknown_payment_is_not_recorded() {
        let ledger = MemoryLedger::new();
        let result = ledger.apply_webhook(&record("evt_x"), succeed("pi_missing")).await;

        assert!(matches!(result, Err(SettlementError::ConsistencyFault(_))));
        assert!(ledger.processed_event_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_invoice_for_unknown_subscription_is_not_recorded() {
        let ledger = MemoryLedger::new();
        let payment = InvoicePayment {
            invoice_id: "in_early".to_string(),
            subscription_id: "sub_not_yet".to_string(),
            payment_intent_id: "pi_invoice".to_string(),
            split: FeeCalculator::default().split(999).unwrap(),
            currency: "usd".to_string(),
            period_start: None,
            period_end: None,
        };

        let result = ledger
            .apply_webhook(&record("evt_inv"), LedgerChange::InvoicePaid(payment))
            .await;

        assert!(matches!(result, Err(SettlementError::ConsistencyFault(_))));
        assert!(ledger.processed_event_ids().await.is_empty());
        assert_eq!(ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_refund_compare_and_set() {
        let ledger = MemoryLedger::new();
        let mut tx = pending("pi_1");
        tx.status = TransactionStatus::Completed;
        ledger.insert_transaction(&tx).await.unwrap();

        let update = RefundUpdate {
            payment_intent_id: "pi_1".to_string(),
            expected_refunded: 0,
            refunded_amount: 4_000,
            refunded_fee: 1_200,
            transfer_reversed: 4_000,
            status: TransactionStatus::PartiallyRefunded,
            refunded_at: OffsetDateTime::now_utc(),
        };
        assert!(ledger.apply_refund(&update).await.unwrap().is_some());
        // Same expectation again loses: the row already moved to 4000
        assert!(ledger.apply_refund(&update).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_records() {
        let ledger = MemoryLedger::new();
        let mut old = record("evt_old");
        old.processed_at = OffsetDateTime::now_utc() - Duration::days(45);
        ledger.apply_webhook(&old, LedgerChange::RecordOnly).await.unwrap();
        ledger
            .apply_webhook(&record("evt_new"), LedgerChange::RecordOnly)
            .await
            .unwrap();

        let pruned = ledger
            .prune_webhook_records(OffsetDateTime::now_utc() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(ledger.processed_event_ids().await, vec!["evt_new".to_string()]);
    }
}
