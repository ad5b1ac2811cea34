//! Postgres ledger
//!
//! Tables (schema in the workspace `migrations/` directory):
//!
//! - `transactions`: keyed by `payment_intent_id` (unique), money columns as
//!   `BIGINT` minor units, `metadata JSONB`
//! - `subscriptions`: keyed by gateway subscription `id`
//! - `orders`: keyed by `id`, `payment_intent_id` unique
//! - `processed_webhook_events`: keyed by `event_id`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    invoice_transaction, unknown_payment, unknown_subscription, AppliedChange, InvoicePayment,
    Ledger, LedgerChange, RefundUpdate, WebhookApplication, WebhookRecord,
};
use crate::error::{SettlementError, SettlementResult};
use crate::order::{Order, OrderUpdate};
use crate::subscriptions::{Subscription, SubscriptionSync};
use crate::transaction::{resolve, Resolution, Transaction, TransactionStatus, TransactionType};

const TRANSACTION_COLUMNS: &str = "id, payment_intent_id, creator_id, payer_id, payout_account_id, \
     gross_amount, platform_fee, creator_earnings, currency, status, transaction_type, metadata, \
     refunded_amount, refunded_fee, transfer_reversed, created_at, updated_at, refunded_at";

const SUBSCRIPTION_COLUMNS: &str = "id, creator_id, payer_id, payout_account_id, tier_name, amount, \
     currency, billing_interval, status, price_id, product_id, current_period_start, \
     current_period_end, canceled_at, cancel_at_period_end, last_event_at, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, payment_intent_id, creator_id, fan_id, amount, status, metadata, \
     video_url, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    payment_intent_id: String,
    creator_id: String,
    payer_id: String,
    payout_account_id: String,
    gross_amount: i64,
    platform_fee: i64,
    creator_earnings: i64,
    currency: String,
    status: String,
    transaction_type: String,
    metadata: Json<HashMap<String, String>>,
    refunded_amount: Option<i64>,
    refunded_fee: i64,
    transfer_reversed: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    refunded_at: Option<OffsetDateTime>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = SettlementError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            payment_intent_id: row.payment_intent_id,
            creator_id: row.creator_id,
            payer_id: row.payer_id,
            payout_account_id: row.payout_account_id,
            gross_amount: row.gross_amount,
            platform_fee: row.platform_fee,
            creator_earnings: row.creator_earnings,
            currency: row.currency,
            status: row.status.parse()?,
            transaction_type: row.transaction_type.parse()?,
            metadata: row.metadata.0,
            refunded_amount: row.refunded_amount,
            refunded_fee: row.refunded_fee,
            transfer_reversed: row.transfer_reversed,
            created_at: row.created_at,
            updated_at: row.updated_at,
            refunded_at: row.refunded_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    creator_id: String,
    payer_id: String,
    payout_account_id: String,
    tier_name: String,
    amount: i64,
    currency: String,
    billing_interval: String,
    status: String,
    price_id: String,
    product_id: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    canceled_at: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    last_event_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = SettlementError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            creator_id: row.creator_id,
            payer_id: row.payer_id,
            payout_account_id: row.payout_account_id,
            tier_name: row.tier_name,
            amount: row.amount,
            currency: row.currency,
            interval: row.billing_interval.parse()?,
            status: row.status.parse()?,
            price_id: row.price_id,
            product_id: row.product_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            canceled_at: row.canceled_at,
            cancel_at_period_end: row.cancel_at_period_end,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    payment_intent_id: String,
    creator_id: String,
    fan_id: String,
    amount: i64,
    status: String,
    metadata: Json<HashMap<String, String>>,
    video_url: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = SettlementError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            payment_intent_id: row.payment_intent_id,
            creator_id: row.creator_id,
            fan_id: row.fan_id,
            amount: row.amount,
            status: row.status.parse()?,
            metadata: row.metadata.0,
            video_url: row.video_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> SettlementResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> SettlementResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SettlementError::Database(format!("Migration failed: {}", e)))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn lock_transaction(
    conn: &mut PgConnection,
    payment_intent_id: &str,
) -> SettlementResult<Option<Transaction>> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {} FROM transactions WHERE payment_intent_id = $1 FOR UPDATE",
        TRANSACTION_COLUMNS
    ))
    .bind(payment_intent_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Transaction::try_from).transpose()
}

async fn lock_subscription(
    conn: &mut PgConnection,
    subscription_id: &str,
) -> SettlementResult<Option<Subscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Subscription::try_from).transpose()
}

/// Insert unless a row with the same payment intent exists; `None` if it did
async fn insert_transaction_if_absent(
    conn: &mut PgConnection,
    transaction: &Transaction,
) -> SettlementResult<Option<Transaction>> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        INSERT INTO transactions ({cols})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (payment_intent_id) DO NOTHING
        RETURNING {cols}
        "#,
        cols = TRANSACTION_COLUMNS
    ))
    .bind(transaction.id)
    .bind(&transaction.payment_intent_id)
    .bind(&transaction.creator_id)
    .bind(&transaction.payer_id)
    .bind(&transaction.payout_account_id)
    .bind(transaction.gross_amount)
    .bind(transaction.platform_fee)
    .bind(transaction.creator_earnings)
    .bind(&transaction.currency)
    .bind(transaction.status.as_str())
    .bind(transaction.transaction_type.as_str())
    .bind(Json(&transaction.metadata))
    .bind(transaction.refunded_amount)
    .bind(transaction.refunded_fee)
    .bind(transaction.transfer_reversed)
    .bind(transaction.created_at)
    .bind(transaction.updated_at)
    .bind(transaction.refunded_at)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Transaction::try_from).transpose()
}

async fn insert_order_if_absent(
    conn: &mut PgConnection,
    order: &Order,
) -> SettlementResult<Option<Order>> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        r#"
        INSERT INTO orders ({cols})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (payment_intent_id) DO NOTHING
        RETURNING {cols}
        "#,
        cols = ORDER_COLUMNS
    ))
    .bind(order.id)
    .bind(&order.payment_intent_id)
    .bind(&order.creator_id)
    .bind(&order.fan_id)
    .bind(order.amount)
    .bind(order.status.as_str())
    .bind(Json(&order.metadata))
    .bind(&order.video_url)
    .bind(order.created_at)
    .bind(order.updated_at)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Order::try_from).transpose()
}

async fn apply_payment_status(
    conn: &mut PgConnection,
    payment_intent_id: &str,
    target: TransactionStatus,
    now: OffsetDateTime,
) -> SettlementResult<AppliedChange> {
    let mut transaction = lock_transaction(conn, payment_intent_id)
        .await?
        .ok_or_else(|| unknown_payment(payment_intent_id))?;

    match resolve(transaction.status, target) {
        Resolution::AlreadyApplied => Ok(AppliedChange::PaymentAlreadyApplied(transaction)),
        Resolution::Illegal => Ok(AppliedChange::PaymentIllegal { transaction, target }),
        Resolution::Apply => {
            let previous = transaction.status;
            transaction.transition(target, now)?;

            sqlx::query(
                "UPDATE transactions SET status = $2, updated_at = $3 \
                 WHERE payment_intent_id = $1 AND status = $4",
            )
            .bind(payment_intent_id)
            .bind(target.as_str())
            .bind(now)
            .bind(previous.as_str())
            .execute(&mut *conn)
            .await?;

            let order = if target == TransactionStatus::Completed
                && transaction.transaction_type == TransactionType::Video
            {
                insert_order_if_absent(conn, &Order::for_payment(&transaction, now)).await?
            } else {
                None
            };

            Ok(AppliedChange::PaymentTransitioned {
                transaction,
                previous,
                order,
            })
        }
    }
}

async fn apply_invoice(
    conn: &mut PgConnection,
    payment: &InvoicePayment,
    now: OffsetDateTime,
) -> SettlementResult<AppliedChange> {
    let mut subscription = lock_subscription(conn, &payment.subscription_id)
        .await?
        .ok_or_else(|| unknown_subscription(&payment.subscription_id))?;

    let candidate = invoice_transaction(payment, &subscription, now);
    let (transaction, created) = match insert_transaction_if_absent(conn, &candidate).await? {
        Some(inserted) => (inserted, true),
        None => {
            let existing = lock_transaction(conn, &payment.payment_intent_id)
                .await?
                .ok_or_else(|| unknown_payment(&payment.payment_intent_id))?;
            (existing, false)
        }
    };

    if let (Some(start), Some(end)) = (payment.period_start, payment.period_end) {
        if subscription.advance_period(start, end, now) {
            sqlx::query(
                "UPDATE subscriptions SET current_period_start = $2, current_period_end = $3, \
                 updated_at = $4 WHERE id = $1",
            )
            .bind(&subscription.id)
            .bind(start)
            .bind(end)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(AppliedChange::InvoiceRecorded {
        transaction,
        subscription,
        created,
    })
}

async fn apply_subscription_sync(
    conn: &mut PgConnection,
    sync: &SubscriptionSync,
    now: OffsetDateTime,
) -> SettlementResult<AppliedChange> {
    let mut subscription = lock_subscription(conn, &sync.subscription_id)
        .await?
        .ok_or_else(|| unknown_subscription(&sync.subscription_id))?;

    let previous = subscription.status;
    if !subscription.apply_sync(sync, now) {
        return Ok(AppliedChange::SubscriptionStale(subscription));
    }

    sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = $2, current_period_start = $3, current_period_end = $4,
            canceled_at = $5, cancel_at_period_end = $6, last_event_at = $7, updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(&subscription.id)
    .bind(subscription.status.as_str())
    .bind(subscription.current_period_start)
    .bind(subscription.current_period_end)
    .bind(subscription.canceled_at)
    .bind(subscription.cancel_at_period_end)
    .bind(subscription.last_event_at)
    .bind(subscription.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(AppliedChange::SubscriptionSynced {
        subscription,
        previous,
    })
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_transaction(&self, transaction: &Transaction) -> SettlementResult<()> {
        let mut conn = self.pool.acquire().await?;
        match insert_transaction_if_absent(&mut conn, transaction).await? {
            Some(_) => Ok(()),
            None => Err(SettlementError::ConsistencyFault(format!(
                "Transaction for payment intent {} already exists",
                transaction.payment_intent_id
            ))),
        }
    }

    async fn find_transaction(&self, payment_intent_id: &str) -> SettlementResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE payment_intent_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn apply_webhook(
        &self,
        record: &WebhookRecord,
        change: LedgerChange,
    ) -> SettlementResult<WebhookApplication> {
        let mut tx = self.pool.begin().await?;

        // Atomic claim: a concurrent delivery of the same id blocks here until
        // this transaction commits, then sees the conflict
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(record.processed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(WebhookApplication::Duplicate);
        }

        let now = record.processed_at;
        // Any error drops `tx`, rolling back the claim with the mutation
        let applied = match change {
            LedgerChange::PaymentStatus {
                payment_intent_id,
                target,
            } => apply_payment_status(&mut tx, &payment_intent_id, target, now).await?,
            LedgerChange::InvoicePaid(payment) => apply_invoice(&mut tx, &payment, now).await?,
            LedgerChange::SubscriptionSync(sync) => {
                apply_subscription_sync(&mut tx, &sync, now).await?
            }
            LedgerChange::RecordOnly => AppliedChange::Recorded,
        };

        tx.commit().await?;
        Ok(WebhookApplication::Applied(applied))
    }

    async fn apply_refund(&self, update: &RefundUpdate) -> SettlementResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE transactions
            SET status = $2, refunded_amount = $3, refunded_fee = $4, transfer_reversed = $5,
                refunded_at = $6, updated_at = $6
            WHERE payment_intent_id = $1
              AND COALESCE(refunded_amount, 0) = $7
              AND status IN ('completed', 'partially_refunded')
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(&update.payment_intent_id)
        .bind(update.status.as_str())
        .bind(update.refunded_amount)
        .bind(update.refunded_fee)
        .bind(update.transfer_reversed)
        .bind(update.refunded_at)
        .bind(update.expected_refunded)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> SettlementResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO subscriptions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(&subscription.id)
        .bind(&subscription.creator_id)
        .bind(&subscription.payer_id)
        .bind(&subscription.payout_account_id)
        .bind(&subscription.tier_name)
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.interval.as_str())
        .bind(subscription.status.as_str())
        .bind(&subscription.price_id)
        .bind(&subscription.product_id)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.last_event_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_subscription(&self, subscription_id: &str) -> SettlementResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn mark_subscription_canceled(
        &self,
        subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> SettlementResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = $2, cancel_at_period_end = FALSE, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .bind(canceled_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_order(&self, order_id: Uuid) -> SettlementResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn update_order(&self, update: &OrderUpdate) -> SettlementResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            UPDATE orders
            SET status = $3, video_url = COALESCE($4, video_url), updated_at = $5
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(update.order_id)
        .bind(update.expected.as_str())
        .bind(update.next.as_str())
        .bind(&update.video_url)
        .bind(update.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn completed_transactions(
        &self,
        creator_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> SettlementResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE creator_id = $1 AND status = 'completed'
              AND created_at >= $2 AND created_at < $3
            ORDER BY created_at
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(creator_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn transactions_updated_since(&self, since: OffsetDateTime) -> SettlementResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE updated_at >= $1",
            TRANSACTION_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn completed_videos_without_order(&self, since: OffsetDateTime) -> SettlementResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT t.payment_intent_id
            FROM transactions t
            LEFT JOIN orders o ON o.payment_intent_id = t.payment_intent_id
            WHERE t.transaction_type = 'video'
              AND t.status IN ('completed', 'partially_refunded', 'refunded')
              AND t.updated_at >= $1
              AND o.id IS NULL
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn prune_webhook_records(&self, before: OffsetDateTime) -> SettlementResult<u64> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> SettlementResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
