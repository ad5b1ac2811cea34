//! Transaction ledger model and its state machine

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SettlementError;
use crate::fees::FeeSplit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    PartiallyRefunded,
    Refunded,
}

impl TransactionStatus {
    /// Every legal edge. Anything not listed here is rejected.
    const TRANSITIONS: &'static [(TransactionStatus, TransactionStatus)] = &[
        (Self::Pending, Self::Completed),
        (Self::Pending, Self::Failed),
        (Self::Completed, Self::Refunded),
        (Self::Completed, Self::PartiallyRefunded),
        (Self::PartiallyRefunded, Self::PartiallyRefunded),
        (Self::PartiallyRefunded, Self::Refunded),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Refunded => "refunded",
        }
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Refunded)
    }

    /// Money has been captured (possibly partially returned since)
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyRefunded | Self::Refunded
        )
    }

    pub fn is_refundable(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyRefunded)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partially_refunded" => Ok(Self::PartiallyRefunded),
            "refunded" => Ok(Self::Refunded),
            other => Err(SettlementError::InvalidInput(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// What an asynchronous event asking for `target` should do to a row in `current`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Apply,
    /// The row already reflects the event (or a later one)
    AlreadyApplied,
    /// Contradicts the row; needs reconciliation
    Illegal,
}

pub fn resolve(current: TransactionStatus, target: TransactionStatus) -> Resolution {
    use TransactionStatus::*;

    if current.can_transition_to(target) {
        return Resolution::Apply;
    }
    match (current, target) {
        (c, t) if c == t => Resolution::AlreadyApplied,
        (PartiallyRefunded | Refunded, Completed) => Resolution::AlreadyApplied,
        // A failed attempt reported after the payment went through
        (Completed | PartiallyRefunded | Refunded, Failed) => Resolution::AlreadyApplied,
        _ => Resolution::Illegal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Video,
    Subscription,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "subscription" => Ok(Self::Subscription),
            other => Err(SettlementError::InvalidInput(format!(
                "Unknown transaction type: {}",
                other
            ))),
        }
    }
}

/// One payment as recorded in the ledger, keyed by its payment intent id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub payment_intent_id: String,
    pub creator_id: String,
    pub payer_id: String,
    /// Connected account the transfer was sent to
    pub payout_account_id: String,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub creator_earnings: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub transaction_type: TransactionType,
    pub metadata: HashMap<String, String>,
    /// Cumulative amount returned to the payer
    pub refunded_amount: Option<i64>,
    /// Cumulative application fee returned
    pub refunded_fee: i64,
    /// Cumulative amount pulled back from the creator's transfer
    pub transfer_reversed: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refunded_at: Option<OffsetDateTime>,
}

/// Fields needed to open a new ledger row
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payment_intent_id: String,
    pub creator_id: String,
    pub payer_id: String,
    pub payout_account_id: String,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub metadata: HashMap<String, String>,
}

impl Transaction {
    pub fn new(
        fields: NewTransaction,
        split: FeeSplit,
        status: TransactionStatus,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_intent_id: fields.payment_intent_id,
            creator_id: fields.creator_id,
            payer_id: fields.payer_id,
            payout_account_id: fields.payout_account_id,
            gross_amount: split.gross_amount,
            platform_fee: split.platform_fee,
            creator_earnings: split.creator_earnings,
            currency: fields.currency,
            status,
            transaction_type: fields.transaction_type,
            metadata: fields.metadata,
            refunded_amount: None,
            refunded_fee: 0,
            transfer_reversed: 0,
            created_at: now,
            updated_at: now,
            refunded_at: None,
        }
    }

    pub fn split(&self) -> FeeSplit {
        FeeSplit {
            gross_amount: self.gross_amount,
            platform_fee: self.platform_fee,
            creator_earnings: self.creator_earnings,
        }
    }

    pub fn refunded_total(&self) -> i64 {
        self.refunded_amount.unwrap_or(0)
    }

    pub fn remaining_refundable(&self) -> i64 {
        self.gross_amount - self.refunded_total()
    }

    /// What the creator keeps after transfer reversals and returned fees
    pub fn creator_net(&self) -> i64 {
        self.creator_earnings - self.transfer_reversed + self.refunded_fee
    }

    /// Move to `next` if the transition table allows it
    pub fn transition(&mut self, next: TransactionStatus, now: OffsetDateTime) -> Result<(), SettlementError> {
        if !self.status.can_transition_to(next) {
            return Err(SettlementError::illegal(self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
