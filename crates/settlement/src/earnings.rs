//! Creator earnings aggregation

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{SettlementError, SettlementResult};
use crate::ledger::Ledger;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsTotals {
    pub total_revenue: i64,
    pub platform_fees: i64,
    pub net_earnings: i64,
    pub transaction_count: u64,
}

impl EarningsTotals {
    fn add(&mut self, transaction: &Transaction) {
        self.total_revenue += transaction.gross_amount;
        self.platform_fees += transaction.platform_fee;
        self.net_earnings += transaction.creator_earnings;
        self.transaction_count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsReport {
    pub creator_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    #[serde(flatten)]
    pub totals: EarningsTotals,
    /// Totals per transaction type (`video`, `subscription`)
    pub by_type: BTreeMap<String, EarningsTotals>,
}

pub struct EarningsAggregator {
    ledger: Arc<dyn Ledger>,
}

impl EarningsAggregator {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Sum a creator's completed transactions created in `[start, end)`.
    ///
    /// Refunded and partially refunded rows are excluded entirely.
    pub async fn report(
        &self,
        creator_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> SettlementResult<EarningsReport> {
        if creator_id.trim().is_empty() {
            return Err(SettlementError::InvalidInput("Creator id is required".to_string()));
        }
        if start >= end {
            return Err(SettlementError::InvalidInput(
                "Start of range must be before its end".to_string(),
            ));
        }

        let transactions = self.ledger.completed_transactions(creator_id, start, end).await?;

        let mut totals = EarningsTotals::default();
        let mut by_type: BTreeMap<String, EarningsTotals> = BTreeMap::new();
        for transaction in &transactions {
            totals.add(transaction);
            by_type
                .entry(transaction.transaction_type.as_str().to_string())
                .or_default()
                .add(transaction);
        }

        tracing::debug!(
            creator_id = %creator_id,
            transactions = totals.transaction_count,
            net_earnings = totals.net_earnings,
            "Aggregated creator earnings"
        );

        Ok(EarningsReport {
            creator_id: creator_id.to_string(),
            start,
            end,
            totals,
            by_type,
        })
    }
}
