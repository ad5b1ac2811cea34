//! Full and partial refunds
//!
//! The gateway refund goes first; the ledger write is a compare-and-set on the
//! refunded total read beforehand, so two concurrent refunds can never both
//! land on the same balance. A refund the gateway accepted but the ledger could
//! not record is surfaced for reconciliation, never retried blindly.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::error::{SettlementError, SettlementResult};
use crate::fees::FeeCalculator;
use crate::gateway::{PaymentGateway, RefundRequest};
use crate::ledger::{Ledger, RefundUpdate};
use crate::notifications::{EventName, Notifier, Severity};
use crate::transaction::TransactionStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    #[default]
    RequestedByCustomer,
    Duplicate,
    Fraudulent,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestedByCustomer => "requested_by_customer",
            Self::Duplicate => "duplicate",
            Self::Fraudulent => "fraudulent",
        }
    }
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundReason {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested_by_customer" => Ok(Self::RequestedByCustomer),
            "duplicate" => Ok(Self::Duplicate),
            "fraudulent" => Ok(Self::Fraudulent),
            other => Err(SettlementError::InvalidInput(format!(
                "Unknown refund reason: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssueRefund {
    pub payment_intent_id: String,
    /// Defaults to everything not yet refunded
    pub amount: Option<i64>,
    pub reason: RefundReason,
    /// Pull the refunded amount back from the creator's transfer
    pub reverse_transfer: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub refund_id: String,
    pub status: TransactionStatus,
    /// Status the gateway reported for the refund itself
    pub gateway_status: String,
    pub amount: i64,
    /// Platform fee returned by this refund
    pub reversed_fee: i64,
    /// Still refundable after this refund
    pub remaining: i64,
}

pub struct RefundService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    fees: FeeCalculator,
    notifier: Notifier,
}

impl RefundService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        fees: FeeCalculator,
        notifier: Notifier,
    ) -> Self {
        Self {
            gateway,
            ledger,
            fees,
            notifier,
        }
    }

    pub async fn refund(&self, request: IssueRefund) -> SettlementResult<RefundResult> {
        let transaction = self
            .ledger
            .find_transaction(&request.payment_intent_id)
            .await?
            .ok_or_else(|| SettlementError::TransactionNotFound(request.payment_intent_id.clone()))?;

        if !transaction.status.is_refundable() {
            return Err(SettlementError::illegal(
                transaction.status,
                TransactionStatus::Refunded,
            ));
        }

        let remaining = transaction.remaining_refundable();
        let amount = request.amount.unwrap_or(remaining);
        if amount <= 0 {
            return Err(SettlementError::InvalidAmount(format!(
                "Refund amount must be positive, got {}",
                amount
            )));
        }
        if amount > remaining {
            return Err(SettlementError::RefundExceedsBalance {
                requested: amount,
                remaining,
            });
        }

        let expected_refunded = transaction.refunded_total();
        let refunded_amount = expected_refunded + amount;
        let transfer_reversed = if request.reverse_transfer {
            transaction.transfer_reversed + amount
        } else {
            transaction.transfer_reversed
        };
        let refunded_fee = self
            .fees
            .fee_reversal(&transaction.split(), transfer_reversed);
        let reversed_fee = refunded_fee - transaction.refunded_fee;
        let status = if refunded_amount == transaction.gross_amount {
            TransactionStatus::Refunded
        } else {
            TransactionStatus::PartiallyRefunded
        };

        let mut metadata = HashMap::new();
        metadata.insert("creator_id".to_string(), transaction.creator_id.clone());
        metadata.insert("transaction_id".to_string(), transaction.id.to_string());

        let refund = self
            .gateway
            .create_refund(RefundRequest {
                payment_intent_id: transaction.payment_intent_id.clone(),
                amount,
                reason: request.reason,
                reverse_transfer: request.reverse_transfer,
                refund_application_fee: request.reverse_transfer,
                metadata,
            })
            .await?;

        let update = RefundUpdate {
            payment_intent_id: transaction.payment_intent_id.clone(),
            expected_refunded,
            refunded_amount,
            refunded_fee,
            transfer_reversed,
            status,
            refunded_at: OffsetDateTime::now_utc(),
        };

        let updated = match self.ledger.apply_refund(&update).await {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                let detail = format!(
                    "Refund {} issued but transaction {} changed concurrently",
                    refund.id, transaction.payment_intent_id
                );
                self.reconciliation_needed(&refund.id, &transaction.payment_intent_id, amount, &detail)
                    .await;
                return Err(SettlementError::ConsistencyFault(detail));
            }
            Err(e) => {
                let detail = format!("Refund {} issued but ledger write failed: {}", refund.id, e);
                self.reconciliation_needed(&refund.id, &transaction.payment_intent_id, amount, &detail)
                    .await;
                return Err(e);
            }
        };

        tracing::info!(
            payment_intent_id = %updated.payment_intent_id,
            refund_id = %refund.id,
            amount = amount,
            reversed_fee = reversed_fee,
            reverse_transfer = request.reverse_transfer,
            reason = %request.reason,
            status = %updated.status,
            "Refund issued"
        );

        self.notifier
            .notify_fan(
                &updated.payer_id,
                EventName::OrderStatusUpdate,
                "Refund issued",
                &format!("A refund of {} {} is on its way", amount, updated.currency.to_uppercase()),
                json!({
                    "paymentIntentId": updated.payment_intent_id,
                    "refundId": refund.id,
                    "amount": amount,
                    "status": updated.status,
                }),
            )
            .await;

        Ok(RefundResult {
            refund_id: refund.id,
            status: updated.status,
            gateway_status: refund.status,
            amount,
            reversed_fee,
            remaining: updated.remaining_refundable(),
        })
    }

    async fn reconciliation_needed(
        &self,
        refund_id: &str,
        payment_intent_id: &str,
        amount: i64,
        detail: &str,
    ) {
        tracing::error!(
            refund_id = %refund_id,
            payment_intent_id = %payment_intent_id,
            amount = amount,
            detail = %detail,
            "RECONCILIATION NEEDED: Gateway refund not reflected in the ledger"
        );
        self.notifier
            .system_alert(
                "refund_ledger_mismatch",
                Severity::Critical,
                json!({
                    "refundId": refund_id,
                    "paymentIntentId": payment_intent_id,
                    "amount": amount,
                    "detail": detail,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelNaming;
    use crate::ledger::MemoryLedger;
    use crate::testing::{completed_video, MockGateway, RecordingPublisher};

    struct Harness {
        service: RefundService,
        gateway: Arc<MockGateway>,
        ledger: Arc<MemoryLedger>,
        recorder: Arc<RecordingPublisher>,
    }

    async fn harness() -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let ledger = Arc::new(MemoryLedger::new());
        let recorder = Arc::new(RecordingPublisher::new());
        ledger.put_transaction(completed_video("pi_1", 10_000)).await;

        let service = RefundService::new(
            gateway.clone(),
            ledger.clone(),
            FeeCalculator::default(),
            Notifier::new(recorder.clone(), ChannelNaming::default()),
        );
        Harness {
            service,
            gateway,
            ledger,
            recorder,
        }
    }

    fn issue(amount: Option<i64>, reverse_transfer: bool) -> IssueRefund {
        IssueRefund {
            payment_intent_id: "pi_1".to_string(),
            amount,
            reason: RefundReason::RequestedByCustomer,
            reverse_transfer,
        }
    }

    #[tokio::test]
    async fn test_full_refund_with_reversal() {
        let h = harness().await;
        let result = h.service.refund(issue(None, true)).await.unwrap();

        assert_eq!(result.amount, 10_000);
        assert_eq!(result.status, TransactionStatus::Refunded);
        assert_eq!(result.reversed_fee, 3_000);
        assert_eq!(result.remaining, 0);

        let tx = h.ledger.find_transaction("pi_1").await.unwrap().unwrap();
        assert_eq!(tx.creator_net(), 0);
        assert!(tx.refunded_at.is_some());

        let requests = h.gateway.refund_requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].reverse_transfer);
        assert!(requests[0].refund_application_fee);
    }

    #[tokio::test]
    async fn test_partial_refund_reverses_proportional_fee() {
        let h = harness().await;
        let result = h.service.refund(issue(Some(4_000), true)).await.unwrap();

        assert_eq!(result.status, TransactionStatus::PartiallyRefunded);
        assert_eq!(result.reversed_fee, 1_200);
        assert_eq!(result.remaining, 6_000);

        let second = h.service.refund(issue(None, true)).await.unwrap();
        assert_eq!(second.amount, 6_000);
        assert_eq!(second.reversed_fee, 1_800);
        assert_eq!(second.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_without_reversal_keeps_creator_earnings() {
        let h = harness().await;
        h.service.refund(issue(Some(2_500), false)).await.unwrap();

        let tx = h.ledger.find_transaction("pi_1").await.unwrap().unwrap();
        assert_eq!(tx.refunded_total(), 2_500);
        assert_eq!(tx.transfer_reversed, 0);
        assert_eq!(tx.refunded_fee, 0);
        assert_eq!(tx.creator_net(), 7_000);
    }

    #[tokio::test]
    async fn test_over_refund_rejected_before_gateway() {
        let h = harness().await;
        assert!(matches!(
            h.service.refund(issue(Some(10_001), true)).await,
            Err(SettlementError::RefundExceedsBalance {
                requested: 10_001,
                remaining: 10_000
            })
        ));
        assert!(matches!(
            h.service.refund(issue(Some(0), true)).await,
            Err(SettlementError::InvalidAmount(_))
        ));
        assert!(h.gateway.refund_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_refunding_fully_refunded_is_illegal() {
        let h = harness().await;
        h.service.refund(issue(None, true)).await.unwrap();
        assert!(matches!(
            h.service.refund(issue(Some(1), true)).await,
            Err(SettlementError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let h = harness().await;
        let mut request = issue(None, true);
        request.payment_intent_id = "pi_missing".to_string();
        assert!(matches!(
            h.service.refund(request).await,
            Err(SettlementError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fan_notified() {
        let h = harness().await;
        h.service.refund(issue(Some(1_000), false)).await.unwrap();

        let sent = h.recorder.messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "fan-fan_1");
        assert_eq!(sent[0].event, "order_status_update");
        assert_eq!(sent[0].data.title, "Refund issued");
    }
}
