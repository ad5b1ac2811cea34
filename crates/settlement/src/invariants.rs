//! Ledger invariants
//!
//! Runnable consistency checks over recently touched ledger rows. They only
//! read; the worker runs them on a schedule and critical violations are raised
//! on the admin alert channel.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::error::SettlementResult;
use crate::ledger::Ledger;
use crate::notifications::{Notifier, Severity};
use crate::transaction::{Transaction, TransactionStatus};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Payment intents affected
    pub payment_intent_ids: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is misattributed
    Critical,
    /// Ledger rows disagree with each other
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 4] = [
    "money_conservation",
    "refund_bounds",
    "refunded_status_consistency",
    "completed_video_has_order",
];

pub struct InvariantChecker {
    ledger: Arc<dyn Ledger>,
    notifier: Notifier,
    /// How far back rows are examined
    lookback: Duration,
}

impl InvariantChecker {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Notifier, lookback: Duration) -> Self {
        Self {
            ledger,
            notifier,
            lookback,
        }
    }

    fn since(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() - self.lookback
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> SettlementResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let since = self.since();
        let transactions = self.ledger.transactions_updated_since(since).await?;

        let mut violations = Vec::new();
        violations.extend(check_money_conservation(&transactions));
        violations.extend(check_refund_bounds(&transactions));
        violations.extend(check_refunded_status_consistency(&transactions));
        violations.extend(self.check_completed_video_has_order(since).await?);

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };
        self.raise(&summary).await;
        Ok(summary)
    }

    /// Run one check by name; unknown names yield no violations
    pub async fn run_check(&self, name: &str) -> SettlementResult<Vec<InvariantViolation>> {
        let since = self.since();
        let violations = match name {
            "completed_video_has_order" => self.check_completed_video_has_order(since).await?,
            "money_conservation" | "refund_bounds" | "refunded_status_consistency" => {
                let transactions = self.ledger.transactions_updated_since(since).await?;
                match name {
                    "money_conservation" => check_money_conservation(&transactions),
                    "refund_bounds" => check_refund_bounds(&transactions),
                    _ => check_refunded_status_consistency(&transactions),
                }
            }
            _ => vec![],
        };
        Ok(violations)
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// A paid video request must always have an order for the creator to act on
    async fn check_completed_video_has_order(
        &self,
        since: OffsetDateTime,
    ) -> SettlementResult<Vec<InvariantViolation>> {
        let missing = self.ledger.completed_videos_without_order(since).await?;
        Ok(missing
            .into_iter()
            .map(|payment_intent_id| InvariantViolation {
                invariant: "completed_video_has_order".to_string(),
                description: format!(
                    "Completed video payment {} has no order",
                    payment_intent_id
                ),
                context: json!({ "paymentIntentId": payment_intent_id }),
                payment_intent_ids: vec![payment_intent_id],
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn raise(&self, summary: &InvariantCheckSummary) {
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Ledger invariants hold");
            return;
        }

        for violation in &summary.violations {
            tracing::warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                payment_intent_ids = ?violation.payment_intent_ids,
                "{}",
                violation.description
            );
        }

        let critical: Vec<&InvariantViolation> = summary
            .violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Critical)
            .collect();
        if critical.is_empty() {
            return;
        }

        self.notifier
            .system_alert(
                "ledger_invariant_violation",
                Severity::Critical,
                json!({
                    "checksFailed": summary.checks_failed,
                    "criticalViolations": critical.len(),
                    "violations": critical,
                }),
            )
            .await;
    }
}

/// `platform_fee + creator_earnings == gross_amount` on every row
fn check_money_conservation(transactions: &[Transaction]) -> Vec<InvariantViolation> {
    transactions
        .iter()
        .filter(|t| t.platform_fee + t.creator_earnings != t.gross_amount)
        .map(|t| InvariantViolation {
            invariant: "money_conservation".to_string(),
            payment_intent_ids: vec![t.payment_intent_id.clone()],
            description: format!(
                "Fee {} plus earnings {} does not equal gross {}",
                t.platform_fee, t.creator_earnings, t.gross_amount
            ),
            context: json!({
                "grossAmount": t.gross_amount,
                "platformFee": t.platform_fee,
                "creatorEarnings": t.creator_earnings,
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

fn check_refund_bounds(transactions: &[Transaction]) -> Vec<InvariantViolation> {
    transactions
        .iter()
        .filter(|t| {
            t.refunded_total() > t.gross_amount
                || t.refunded_fee > t.platform_fee
                || t.transfer_reversed > t.refunded_total()
        })
        .map(|t| InvariantViolation {
            invariant: "refund_bounds".to_string(),
            payment_intent_ids: vec![t.payment_intent_id.clone()],
            description: "Refunded amounts exceed what was charged".to_string(),
            context: json!({
                "grossAmount": t.gross_amount,
                "refundedAmount": t.refunded_total(),
                "platformFee": t.platform_fee,
                "refundedFee": t.refunded_fee,
                "transferReversed": t.transfer_reversed,
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

/// `refunded` exactly when everything was returned; partial refunds in between
fn check_refunded_status_consistency(transactions: &[Transaction]) -> Vec<InvariantViolation> {
    transactions
        .iter()
        .filter(|t| {
            let refunded = t.refunded_total();
            match t.status {
                TransactionStatus::Refunded => refunded != t.gross_amount,
                TransactionStatus::PartiallyRefunded => refunded <= 0 || refunded >= t.gross_amount,
                _ => refunded != 0,
            }
        })
        .map(|t| InvariantViolation {
            invariant: "refunded_status_consistency".to_string(),
            payment_intent_ids: vec![t.payment_intent_id.clone()],
            description: format!(
                "Status {} does not match refunded amount {} of {}",
                t.status,
                t.refunded_total(),
                t.gross_amount
            ),
            context: json!({
                "status": t.status,
                "refundedAmount": t.refunded_total(),
                "grossAmount": t.gross_amount,
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}
