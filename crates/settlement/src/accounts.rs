//! Creator payout account validation

use std::sync::Arc;

use serde::Serialize;

use crate::error::{SettlementError, SettlementResult};
use crate::gateway::PaymentGateway;

/// Connected account that receives a creator's share
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorPayoutAccount {
    pub creator_id: String,
    pub account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

/// Confirms a payout account can receive funds.
///
/// Asks the gateway every time; account capabilities can be revoked at any
/// moment so nothing is cached.
#[derive(Clone)]
pub struct AccountValidator {
    gateway: Arc<dyn PaymentGateway>,
}

impl AccountValidator {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }

    pub async fn validate(
        &self,
        creator_id: &str,
        account_id: &str,
    ) -> SettlementResult<CreatorPayoutAccount> {
        if account_id.trim().is_empty() {
            return Err(SettlementError::AccountNotFound(account_id.to_string()));
        }

        let account = self
            .gateway
            .retrieve_account(account_id)
            .await?
            .ok_or_else(|| SettlementError::AccountNotFound(account_id.to_string()))?;

        if !account.charges_enabled || !account.payouts_enabled {
            tracing::warn!(
                creator_id = %creator_id,
                account_id = %account.id,
                charges_enabled = account.charges_enabled,
                payouts_enabled = account.payouts_enabled,
                "Payout account not ready"
            );
            return Err(SettlementError::AccountNotReady {
                account_id: account.id,
                charges_enabled: account.charges_enabled,
                payouts_enabled: account.payouts_enabled,
            });
        }

        Ok(CreatorPayoutAccount {
            creator_id: creator_id.to_string(),
            account_id: account.id,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockGateway;

    #[tokio::test]
    async fn test_ready_account() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_account("acct_ready", true, true).await;

        let account = AccountValidator::new(gateway)
            .validate("creator_1", "acct_ready")
            .await
            .unwrap();
        assert_eq!(account.creator_id, "creator_1");
        assert_eq!(account.account_id, "acct_ready");
        assert!(account.charges_enabled && account.payouts_enabled);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let validator = AccountValidator::new(Arc::new(MockGateway::new()));
        assert!(matches!(
            validator.validate("creator_1", "acct_missing").await,
            Err(SettlementError::AccountNotFound(_))
        ));
        assert!(matches!(
            validator.validate("creator_1", "").await,
            Err(SettlementError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_either_flag_false_is_not_ready() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_account("acct_no_charges", false, true).await;
        gateway.add_account("acct_no_payouts", true, false).await;
        let validator = AccountValidator::new(gateway);

        for id in ["acct_no_charges", "acct_no_payouts"] {
            assert!(matches!(
                validator.validate("creator_1", id).await,
                Err(SettlementError::AccountNotReady { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_not_cached() {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_account("acct_flip", true, true).await;
        let validator = AccountValidator::new(gateway.clone());

        assert!(validator.validate("creator_1", "acct_flip").await.is_ok());
        gateway.add_account("acct_flip", false, true).await;
        assert!(validator.validate("creator_1", "acct_flip").await.is_err());
    }
}
