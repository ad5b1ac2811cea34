//! Payment intent creation
//!
//! Issues a destination charge at the gateway (full amount transferred to the
//! creator, platform fee retained as the application fee) and opens a
//! `pending` ledger row before the client ever sees the intent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::accounts::AccountValidator;
use crate::client::tagged;
use crate::error::{SettlementError, SettlementResult};
use crate::fees::FeeCalculator;
use crate::gateway::{PaymentGateway, PaymentIntentRequest};
use crate::ledger::Ledger;
use crate::transaction::{NewTransaction, Transaction, TransactionStatus, TransactionType};

#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub creator_id: String,
    pub creator_account_id: String,
    pub payer_id: String,
    pub amount: i64,
    pub metadata: HashMap<String, String>,
}

/// What the client needs to confirm the payment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPayment {
    pub payment_intent_id: String,
    pub client_secret: String,
    pub amount: i64,
    pub platform_fee: i64,
    pub creator_earnings: i64,
}

pub struct PaymentService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn Ledger>,
    accounts: AccountValidator,
    fees: FeeCalculator,
    currency: String,
    minimum_amount: i64,
}

impl PaymentService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        fees: FeeCalculator,
        currency: String,
        minimum_amount: i64,
    ) -> Self {
        Self {
            accounts: AccountValidator::new(gateway.clone()),
            gateway,
            ledger,
            fees,
            currency,
            minimum_amount,
        }
    }

    pub async fn create_payment(&self, request: CreatePayment) -> SettlementResult<PendingPayment> {
        let split = self.fees.split(request.amount)?;
        if request.amount < self.minimum_amount {
            return Err(SettlementError::InvalidAmount(format!(
                "Amount {} is below the minimum of {}",
                request.amount, self.minimum_amount
            )));
        }
        if request.creator_id.trim().is_empty() || request.payer_id.trim().is_empty() {
            return Err(SettlementError::InvalidInput(
                "Creator and payer ids are required".to_string(),
            ));
        }

        let account = self
            .accounts
            .validate(&request.creator_id, &request.creator_account_id)
            .await?;

        let mut metadata = tagged(request.metadata.clone(), &request.creator_id, &request.payer_id);
        metadata.insert(
            "transaction_type".to_string(),
            TransactionType::Video.as_str().to_string(),
        );

        let intent = self
            .gateway
            .create_payment_intent(PaymentIntentRequest {
                amount: split.gross_amount,
                currency: self.currency.clone(),
                application_fee_amount: split.platform_fee,
                destination_account: account.account_id.clone(),
                metadata,
            })
            .await?;

        let transaction = Transaction::new(
            NewTransaction {
                payment_intent_id: intent.id.clone(),
                creator_id: account.creator_id,
                payer_id: request.payer_id,
                payout_account_id: account.account_id,
                currency: self.currency.clone(),
                transaction_type: TransactionType::Video,
                metadata: request.metadata,
            },
            split,
            TransactionStatus::Pending,
            OffsetDateTime::now_utc(),
        );

        if let Err(e) = self.ledger.insert_transaction(&transaction).await {
            tracing::error!(
                payment_intent_id = %intent.id,
                creator_id = %transaction.creator_id,
                error = %e,
                "RECONCILIATION NEEDED: Payment intent created but ledger row could not be written"
            );
            return Err(e);
        }

        tracing::info!(
            payment_intent_id = %intent.id,
            creator_id = %transaction.creator_id,
            payer_id = %transaction.payer_id,
            gross_amount = split.gross_amount,
            platform_fee = split.platform_fee,
            creator_earnings = split.creator_earnings,
            "Created payment intent"
        );

        Ok(PendingPayment {
            payment_intent_id: intent.id,
            client_secret: intent.client_secret,
            amount: split.gross_amount,
            platform_fee: split.platform_fee,
            creator_earnings: split.creator_earnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::testing::MockGateway;

    async fn service() -> (PaymentService, Arc<MockGateway>, Arc<MemoryLedger>) {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_account("acct_ready", true, true).await;
        gateway.add_account("acct_no_charges", false, true).await;
        let ledger = Arc::new(MemoryLedger::new());
        let service = PaymentService::new(
            gateway.clone(),
            ledger.clone(),
            FeeCalculator::default(),
            "usd".to_string(),
            100,
        );
        (service, gateway, ledger)
    }

    fn request(account: &str, amount: i64) -> CreatePayment {
        CreatePayment {
            creator_id: "creator_1".to_string(),
            creator_account_id: account.to_string(),
            payer_id: "fan_1".to_string(),
            amount,
            metadata: HashMap::from([("occasion".to_string(), "birthday".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_creates_pending_transaction() {
        let (service, gateway, ledger) = service().await;
        let pending = service.create_payment(request("acct_ready", 10_000)).await.unwrap();

        assert_eq!(pending.platform_fee, 3_000);
        assert_eq!(pending.creator_earnings, 7_000);
        assert!(!pending.client_secret.is_empty());

        let tx = ledger
            .find_transaction(&pending.payment_intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.payout_account_id, "acct_ready");

        let intents = gateway.payment_intents().await;
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].application_fee_amount, 3_000);
        assert_eq!(intents[0].destination_account, "acct_ready");
        assert_eq!(intents[0].metadata["creator_id"], "creator_1");
    }

    #[tokio::test]
    async fn test_below_minimum_rejected_before_gateway() {
        let (service, gateway, ledger) = service().await;
        assert!(matches!(
            service.create_payment(request("acct_ready", 50)).await,
            Err(SettlementError::InvalidAmount(_))
        ));
        assert!(gateway.payment_intents().await.is_empty());
        assert_eq!(ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_unready_account_writes_nothing() {
        let (service, gateway, ledger) = service().await;
        assert!(matches!(
            service.create_payment(request("acct_no_charges", 10_000)).await,
            Err(SettlementError::AccountNotReady { .. })
        ));
        assert!(gateway.payment_intents().await.is_empty());
        assert_eq!(ledger.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_surfaces_as_gateway_error() {
        let (service, gateway, ledger) = service().await;
        gateway.fail_next("card_declined").await;

        assert!(matches!(
            service.create_payment(request("acct_ready", 10_000)).await,
            Err(SettlementError::Gateway(_))
        ));
        assert_eq!(ledger.transaction_count().await, 0);
    }
}
