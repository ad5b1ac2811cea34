//! Platform fee split
//!
//! All amounts are integer minor units (cents). The platform fee is computed
//! first, rounded half-up to the nearest cent; creator earnings are the
//! remainder, so `platform_fee + creator_earnings == gross_amount` holds exactly.

use serde::{Deserialize, Serialize};

use crate::error::{SettlementError, SettlementResult};

/// 30% platform fee, in basis points
pub const DEFAULT_PLATFORM_FEE_BPS: u32 = 3_000;

const BPS_DENOMINATOR: i128 = 10_000;

/// Result of splitting a gross amount between platform and creator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub creator_earnings: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeCalculator {
    fee_bps: u32,
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self {
            fee_bps: DEFAULT_PLATFORM_FEE_BPS,
        }
    }
}

impl FeeCalculator {
    pub fn new(fee_bps: u32) -> SettlementResult<Self> {
        if i128::from(fee_bps) > BPS_DENOMINATOR {
            return Err(SettlementError::Config(format!(
                "Platform fee of {} bps exceeds 100%",
                fee_bps
            )));
        }
        Ok(Self { fee_bps })
    }

    pub fn fee_bps(&self) -> u32 {
        self.fee_bps
    }

    /// Fee rate as a percentage, the form recurring application fees are expressed in
    pub fn fee_percent(&self) -> f64 {
        f64::from(self.fee_bps) / 100.0
    }

    /// Split a gross amount into platform fee and creator earnings
    pub fn split(&self, gross_amount: i64) -> SettlementResult<FeeSplit> {
        if gross_amount <= 0 {
            return Err(SettlementError::InvalidAmount(format!(
                "Amount must be a positive number of minor units, got {}",
                gross_amount
            )));
        }

        let platform_fee = round_half_up(
            i128::from(gross_amount) * i128::from(self.fee_bps),
            BPS_DENOMINATOR,
        );

        Ok(FeeSplit {
            gross_amount,
            platform_fee,
            creator_earnings: gross_amount - platform_fee,
        })
    }

    /// Cumulative application fee to return once `refunded_total` of the gross
    /// amount has been refunded.
    ///
    /// Proportional to the original fee, so a full refund reverses the whole fee.
    pub fn fee_reversal(&self, split: &FeeSplit, refunded_total: i64) -> i64 {
        if split.gross_amount <= 0 || refunded_total <= 0 {
            return 0;
        }
        let refunded_total = refunded_total.min(split.gross_amount);
        round_half_up(
            i128::from(refunded_total) * i128::from(split.platform_fee),
            i128::from(split.gross_amount),
        )
    }
}

fn round_half_up(numerator: i128, denominator: i128) -> i64 {
    let rounded = (numerator + denominator / 2) / denominator;
    // Bounded by the (i64) numerator operand since the rate never exceeds 100%
    i64::try_from(rounded).unwrap_or(i64::MAX)
}
