//! Gateway webhook processing
//!
//! Verifies the signature, claims the event id and applies the resulting
//! ledger change in one atomic unit, then fans out notifications in the
//! background. Events may arrive duplicated, concurrently and in any order.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::client::timestamp;
use crate::error::{SettlementError, SettlementResult};
use crate::events::{GatewayEvent, GatewayEventKind, InvoiceObject, SubscriptionObject};
use crate::fees::FeeCalculator;
use crate::ledger::{
    AppliedChange, InvoicePayment, Ledger, LedgerChange, WebhookApplication, WebhookRecord,
};
use crate::notifications::{EventName, Notifier, Severity};
use crate::subscriptions::{SubscriptionStatus, SubscriptionSync};
use crate::transaction::TransactionStatus;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `t=<unix>,v1=<hex>` signature header.
///
/// The signed content is `"{t}.{payload}"` under HMAC-SHA256 keyed with the
/// endpoint secret. Timestamps further than `tolerance_secs` from `now` fail.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> SettlementResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        SettlementError::InvalidSignature
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(SettlementError::InvalidSignature);
    }

    // Header timestamps are attacker-controlled; abs_diff cannot overflow
    let skew = now.abs_diff(timestamp);
    if skew > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = skew,
            "Webhook timestamp outside tolerance"
        );
        return Err(SettlementError::InvalidSignature);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    let matched = candidates.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(signed_payload.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&expected).is_ok()
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(SettlementError::InvalidSignature);
    }
    Ok(())
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`, the `v1` value of a signature header
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> SettlementResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SettlementError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// How a webhook delivery was handled. Every variant acknowledges the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// State changed
    Applied,
    /// Event id seen before
    Duplicate,
    /// The ledger already reflects this or a later event
    Stale,
    /// Recorded, but contradicts the ledger; raised for reconciliation
    Conflict,
    /// Recorded without any state change
    Ignored,
}

pub struct WebhookProcessor {
    ledger: Arc<dyn Ledger>,
    notifier: Notifier,
    fees: FeeCalculator,
    webhook_secret: String,
    tolerance_secs: i64,
    /// Notification fan-out for committed events, off the acknowledgement path
    notifications: Mutex<JoinSet<()>>,
}

impl WebhookProcessor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        notifier: Notifier,
        fees: FeeCalculator,
        webhook_secret: String,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            ledger,
            notifier,
            fees,
            webhook_secret,
            tolerance_secs,
            notifications: Mutex::new(JoinSet::new()),
        }
    }

    /// Verify, parse and process a raw webhook delivery
    pub async fn handle(&self, payload: &str, signature_header: &str) -> SettlementResult<WebhookOutcome> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            self.tolerance_secs,
            now,
        )?;

        let event = GatewayEvent::parse(payload)?;
        self.process(event).await
    }

    /// Process an already-verified event
    pub async fn process(&self, event: GatewayEvent) -> SettlementResult<WebhookOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing gateway webhook event"
        );

        let change = self.plan(&event)?;
        let record = WebhookRecord {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            processed_at: OffsetDateTime::now_utc(),
        };

        let application = match self.ledger.apply_webhook(&record, change).await {
            Ok(application) => application,
            Err(SettlementError::ConsistencyFault(detail)) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    detail = %detail,
                    "RECONCILIATION NEEDED: Webhook does not match the ledger; leaving it unrecorded for redelivery"
                );
                self.notifier
                    .system_alert(
                        "webhook_consistency_fault",
                        Severity::Critical,
                        json!({
                            "eventId": event.id,
                            "eventType": event.event_type,
                            "detail": detail,
                        }),
                    )
                    .await;
                return Err(SettlementError::ConsistencyFault(detail));
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to apply webhook event"
                );
                return Err(e);
            }
        };

        match application {
            WebhookApplication::Duplicate => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, already processed"
                );
                Ok(WebhookOutcome::Duplicate)
            }
            WebhookApplication::Applied(applied) => {
                let acknowledged = outcome(&applied);
                self.spawn_fan_out(event, applied).await;
                Ok(acknowledged)
            }
        }
    }

    async fn spawn_fan_out(&self, event: GatewayEvent, applied: AppliedChange) {
        let mut tasks = self.notifications.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            log_fan_out_failure(finished);
        }
        tasks.spawn(fan_out(self.notifier.clone(), event, applied));
    }

    /// Wait for every notification fan-out spawned so far
    pub async fn flush_notifications(&self) {
        let mut tasks = self.notifications.lock().await;
        while let Some(finished) = tasks.join_next().await {
            log_fan_out_failure(finished);
        }
    }

    /// Translate an event into the ledger change it asks for
    fn plan(&self, event: &GatewayEvent) -> SettlementResult<LedgerChange> {
        let change = match &event.kind {
            GatewayEventKind::PaymentSucceeded(intent) | GatewayEventKind::PaymentFailed(intent)
                if !intent.is_marketplace_charge() =>
            {
                tracing::info!(
                    event_id = %event.id,
                    payment_intent_id = %intent.id,
                    invoice_id = intent.invoice.as_deref().unwrap_or(""),
                    "Payment intent not a marketplace charge, ignoring"
                );
                LedgerChange::RecordOnly
            }
            GatewayEventKind::PaymentSucceeded(intent) => LedgerChange::PaymentStatus {
                payment_intent_id: intent.id.clone(),
                target: TransactionStatus::Completed,
            },
            GatewayEventKind::PaymentFailed(intent) => LedgerChange::PaymentStatus {
                payment_intent_id: intent.id.clone(),
                target: TransactionStatus::Failed,
            },
            GatewayEventKind::SubscriptionChanged(subscription) => {
                self.plan_subscription(event, subscription, None)?
            }
            GatewayEventKind::SubscriptionDeleted(subscription) => {
                self.plan_subscription(event, subscription, Some(SubscriptionStatus::Canceled))?
            }
            GatewayEventKind::InvoicePaid(invoice) => self.plan_invoice(event, invoice)?,
            GatewayEventKind::Unhandled => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type"
                );
                LedgerChange::RecordOnly
            }
        };
        Ok(change)
    }

    fn plan_subscription(
        &self,
        event: &GatewayEvent,
        subscription: &SubscriptionObject,
        status_override: Option<SubscriptionStatus>,
    ) -> SettlementResult<LedgerChange> {
        if !subscription.is_marketplace() {
            tracing::info!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "Subscription not created by the marketplace, ignoring"
            );
            return Ok(LedgerChange::RecordOnly);
        }

        let status = match status_override {
            Some(status) => status,
            None => match subscription.status.parse::<SubscriptionStatus>() {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        status = %subscription.status,
                        "Unknown subscription status, ignoring event"
                    );
                    return Ok(LedgerChange::RecordOnly);
                }
            },
        };

        let (start, end) = subscription.period();
        Ok(LedgerChange::SubscriptionSync(SubscriptionSync {
            subscription_id: subscription.id.clone(),
            status,
            current_period_start: start.map(timestamp).transpose()?,
            current_period_end: end.map(timestamp).transpose()?,
            canceled_at: subscription.canceled_at.map(timestamp).transpose()?,
            cancel_at_period_end: subscription.cancel_at_period_end,
            event_at: event.created,
        }))
    }

    fn plan_invoice(&self, event: &GatewayEvent, invoice: &InvoiceObject) -> SettlementResult<LedgerChange> {
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::info!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                "Invoice is not for a subscription, ignoring"
            );
            return Ok(LedgerChange::RecordOnly);
        };

        if !invoice.is_marketplace() {
            tracing::info!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                subscription_id = %subscription_id,
                "Invoice not for a marketplace subscription, ignoring"
            );
            return Ok(LedgerChange::RecordOnly);
        }

        if invoice.amount_paid <= 0 {
            tracing::info!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                "Zero-amount invoice, nothing to settle"
            );
            return Ok(LedgerChange::RecordOnly);
        }

        let (period_start, period_end) = match invoice.period() {
            Some((start, end)) => (Some(timestamp(start)?), Some(timestamp(end)?)),
            None => (None, None),
        };

        Ok(LedgerChange::InvoicePaid(InvoicePayment {
            invoice_id: invoice.id.clone(),
            subscription_id: subscription_id.to_string(),
            payment_intent_id: invoice.payment_key().to_string(),
            split: self.fees.split(invoice.amount_paid)?,
            currency: invoice.currency.to_lowercase(),
            period_start,
            period_end,
        }))
    }
}

fn log_fan_out_failure(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        tracing::error!(error = %e, "Webhook notification task failed");
    }
}

/// What the committed change means for the delivery's acknowledgement
fn outcome(applied: &AppliedChange) -> WebhookOutcome {
    match applied {
        AppliedChange::PaymentTransitioned { .. } => WebhookOutcome::Applied,
        AppliedChange::PaymentAlreadyApplied(_) => WebhookOutcome::Stale,
        AppliedChange::PaymentIllegal { .. } => WebhookOutcome::Conflict,
        AppliedChange::InvoiceRecorded { created: true, .. } => WebhookOutcome::Applied,
        AppliedChange::InvoiceRecorded { created: false, .. } => WebhookOutcome::Stale,
        AppliedChange::SubscriptionSynced { .. } => WebhookOutcome::Applied,
        AppliedChange::SubscriptionStale(_) => WebhookOutcome::Stale,
        AppliedChange::Recorded => WebhookOutcome::Ignored,
    }
}

/// Logging and notifications for a committed change. Never fails.
async fn fan_out(notifier: Notifier, event: GatewayEvent, applied: AppliedChange) {
    match applied {
        AppliedChange::PaymentTransitioned {
            transaction,
            previous,
            order,
        } => {
            tracing::info!(
                event_id = %event.id,
                payment_intent_id = %transaction.payment_intent_id,
                from = %previous,
                to = %transaction.status,
                "Transaction status updated"
            );

            let payment_data = json!({
                "paymentIntentId": transaction.payment_intent_id,
                "amount": transaction.gross_amount,
                "status": transaction.status,
            });

            if transaction.status == TransactionStatus::Completed {
                if let Some(order) = &order {
                    notifier.new_order(order).await;
                }
                notifier
                    .notify_fan(
                        &transaction.payer_id,
                        EventName::OrderStatusUpdate,
                        "Payment confirmed",
                        "Your payment went through and the creator has been notified",
                        json!({
                            "paymentIntentId": transaction.payment_intent_id,
                            "amount": transaction.gross_amount,
                            "status": transaction.status,
                            "orderId": order.as_ref().map(|o| o.id),
                        }),
                    )
                    .await;
            } else {
                let reason = match &event.kind {
                    GatewayEventKind::PaymentFailed(intent) => intent
                        .last_payment_error
                        .as_ref()
                        .and_then(|e| e.message.clone()),
                    _ => None,
                };
                notifier
                    .notify_fan(
                        &transaction.payer_id,
                        EventName::OrderStatusUpdate,
                        "Payment failed",
                        reason.as_deref().unwrap_or("Your payment could not be completed"),
                        payment_data,
                    )
                    .await;
            }
        }
        AppliedChange::PaymentAlreadyApplied(transaction) => {
            tracing::info!(
                event_id = %event.id,
                payment_intent_id = %transaction.payment_intent_id,
                status = %transaction.status,
                "Transaction already reflects event, nothing to do"
            );
        }
        AppliedChange::PaymentIllegal {
            transaction,
            target,
        } => {
            tracing::error!(
                event_id = %event.id,
                payment_intent_id = %transaction.payment_intent_id,
                current = %transaction.status,
                requested = %target,
                "RECONCILIATION NEEDED: Webhook requests an illegal transaction transition"
            );
            notifier
                .system_alert(
                    "illegal_transaction_transition",
                    Severity::Critical,
                    json!({
                        "eventId": event.id,
                        "paymentIntentId": transaction.payment_intent_id,
                        "current": transaction.status,
                        "requested": target,
                    }),
                )
                .await;
        }
        AppliedChange::InvoiceRecorded {
            transaction,
            subscription,
            created,
        } => {
            if !created {
                tracing::info!(
                    event_id = %event.id,
                    payment_intent_id = %transaction.payment_intent_id,
                    "Invoice payment already recorded"
                );
                return;
            }

            tracing::info!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                payment_intent_id = %transaction.payment_intent_id,
                gross_amount = transaction.gross_amount,
                platform_fee = transaction.platform_fee,
                "Recorded subscription payment"
            );

            let first_invoice = matches!(
                &event.kind,
                GatewayEventKind::InvoicePaid(invoice)
                    if invoice.billing_reason.as_deref() == Some("subscription_create")
            );
            if !first_invoice {
                notifier
                    .notify_creator(
                        &subscription.creator_id,
                        EventName::SubscriptionRenewed,
                        "Subscription renewed",
                        &format!("A {} subscription renewed", subscription.tier_name),
                        json!({
                            "subscriptionId": subscription.id,
                            "amount": transaction.gross_amount,
                            "creatorEarnings": transaction.creator_earnings,
                            "currentPeriodEnd": subscription.current_period_end.unix_timestamp(),
                        }),
                    )
                    .await;
            }
        }
        AppliedChange::SubscriptionSynced {
            subscription,
            previous,
        } => {
            tracing::info!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                from = %previous,
                to = %subscription.status,
                "Subscription synced"
            );
            if subscription.status == SubscriptionStatus::Canceled
                && previous != SubscriptionStatus::Canceled
            {
                notifier
                    .notify_creator(
                        &subscription.creator_id,
                        EventName::SubscriptionCanceled,
                        "Subscription canceled",
                        &format!("A {} subscription ended", subscription.tier_name),
                        json!({ "subscriptionId": subscription.id }),
                    )
                    .await;
            }
        }
        AppliedChange::SubscriptionStale(subscription) => {
            tracing::info!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "Out-of-order subscription event, keeping newer state"
            );
        }
        AppliedChange::Recorded => {}
    }
}
