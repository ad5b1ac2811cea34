//! Settlement error taxonomy

use thiserror::Error;

pub type SettlementResult<T> = Result<T, SettlementError>;

/// Coarse classification used by the HTTP layer and by log routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any gateway call or ledger write
    Validation,
    /// The payment gateway declined or could not be reached
    Gateway,
    /// Ledger and gateway disagree; needs reconciliation
    Consistency,
    /// Webhook authenticity could not be established
    Authentication,
    /// Everything else (datastore, configuration, publishing)
    Internal,
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payout account not found: {0}")]
    AccountNotFound(String),

    #[error(
        "Payout account {account_id} is not ready (charges_enabled={charges_enabled}, payouts_enabled={payouts_enabled})"
    )]
    AccountNotReady {
        account_id: String,
        charges_enabled: bool,
        payouts_enabled: bool,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Refund of {requested} exceeds remaining balance of {remaining}")]
    RefundExceedsBalance { requested: i64, remaining: i64 },

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Consistency fault: {0}")]
    ConsistencyFault(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SettlementError::InvalidAmount(_)
            | SettlementError::InvalidInput(_)
            | SettlementError::AccountNotFound(_)
            | SettlementError::AccountNotReady { .. }
            | SettlementError::TransactionNotFound(_)
            | SettlementError::SubscriptionNotFound(_)
            | SettlementError::OrderNotFound(_)
            | SettlementError::RefundExceedsBalance { .. }
            | SettlementError::IllegalTransition { .. } => ErrorKind::Validation,
            SettlementError::InvalidSignature => ErrorKind::Authentication,
            SettlementError::Gateway(_) => ErrorKind::Gateway,
            SettlementError::ConsistencyFault(_) => ErrorKind::Consistency,
            SettlementError::Database(_)
            | SettlementError::Publish(_)
            | SettlementError::Config(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn illegal(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        SettlementError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<sqlx::Error> for SettlementError {
    fn from(e: sqlx::Error) -> Self {
        SettlementError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for SettlementError {
    fn from(e: stripe::StripeError) -> Self {
        SettlementError::Gateway(e.to_string())
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(e: serde_json::Error) -> Self {
        SettlementError::InvalidInput(e.to_string())
    }
}
