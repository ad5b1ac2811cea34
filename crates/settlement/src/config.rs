//! Settlement configuration
//!
//! Built once at the binary edge and handed to [`crate::SettlementService::new`];
//! nothing below this module reads the environment.

use crate::error::{SettlementError, SettlementResult};
use crate::fees::DEFAULT_PLATFORM_FEE_BPS;

/// Smallest chargeable amount in minor units
pub const DEFAULT_MINIMUM_AMOUNT: i64 = 100;
/// Accepted clock skew for webhook signature timestamps
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;
/// How long processed webhook event ids are kept for deduplication
pub const DEFAULT_WEBHOOK_RETENTION_DAYS: i64 = 30;
/// Window of recently updated ledger rows the invariant checks examine
pub const DEFAULT_INVARIANT_LOOKBACK_HOURS: i64 = 48;

const MAX_WEBHOOK_TOLERANCE_SECS: i64 = 24 * 60 * 60;
const MAX_WEBHOOK_RETENTION_DAYS: i64 = 3650;
const MAX_INVARIANT_LOOKBACK_HOURS: i64 = 24 * 365;

/// Gateway credentials
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> SettlementResult<Self> {
        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
        })
    }
}

/// External pub/sub service endpoint
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub url: String,
    pub secret: String,
}

impl PubSubConfig {
    /// `None` when `PUBSUB_URL` is unset, meaning events stay in-process
    pub fn from_env() -> SettlementResult<Option<Self>> {
        let Some(url) = optional("PUBSUB_URL") else {
            return Ok(None);
        };
        Ok(Some(Self {
            url,
            secret: required("PUBSUB_SECRET")?,
        }))
    }
}

/// Channel name scheme shared by publishers and subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNaming {
    pub creator_prefix: String,
    pub fan_prefix: String,
    pub all_creators: String,
    pub admin_alerts: String,
}

impl Default for ChannelNaming {
    fn default() -> Self {
        Self {
            creator_prefix: "creator-".to_string(),
            fan_prefix: "fan-".to_string(),
            all_creators: "all-creators".to_string(),
            admin_alerts: "admin-alerts".to_string(),
        }
    }
}

impl ChannelNaming {
    pub fn creator(&self, creator_id: &str) -> String {
        format!("{}{}", self.creator_prefix, creator_id)
    }

    pub fn fan(&self, fan_id: &str) -> String {
        format!("{}{}", self.fan_prefix, fan_id)
    }

    pub fn all_creators(&self) -> String {
        self.all_creators.clone()
    }

    pub fn admin_alerts(&self) -> String {
        self.admin_alerts.clone()
    }

    /// Whether a channel name belongs to this scheme
    pub fn is_known(&self, channel: &str) -> bool {
        let suffixed = |prefix: &str| {
            channel
                .strip_prefix(prefix)
                .is_some_and(|id| !id.is_empty())
        };
        channel == self.all_creators
            || channel == self.admin_alerts
            || suffixed(&self.creator_prefix)
            || suffixed(&self.fan_prefix)
    }
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub stripe: StripeConfig,
    /// ISO currency code payments settle in
    pub currency: String,
    pub platform_fee_bps: u32,
    pub minimum_amount: i64,
    pub webhook_tolerance_secs: i64,
    pub webhook_retention_days: i64,
    pub invariant_lookback_hours: i64,
    pub channels: ChannelNaming,
    pub pubsub: Option<PubSubConfig>,
}

impl SettlementConfig {
    /// Defaults for everything except credentials
    pub fn new(stripe: StripeConfig) -> Self {
        Self {
            stripe,
            currency: "usd".to_string(),
            platform_fee_bps: DEFAULT_PLATFORM_FEE_BPS,
            minimum_amount: DEFAULT_MINIMUM_AMOUNT,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
            webhook_retention_days: DEFAULT_WEBHOOK_RETENTION_DAYS,
            invariant_lookback_hours: DEFAULT_INVARIANT_LOOKBACK_HOURS,
            channels: ChannelNaming::default(),
            pubsub: None,
        }
    }

    pub fn from_env() -> SettlementResult<Self> {
        let mut config = Self::new(StripeConfig::from_env()?);

        if let Some(currency) = optional("SETTLEMENT_CURRENCY") {
            config.currency = currency.to_lowercase();
        }
        config.platform_fee_bps = parsed("PLATFORM_FEE_BPS", config.platform_fee_bps)?;
        config.minimum_amount = parsed("MINIMUM_AMOUNT_CENTS", config.minimum_amount)?;
        config.webhook_tolerance_secs =
            parsed("WEBHOOK_TOLERANCE_SECS", config.webhook_tolerance_secs)?;
        config.webhook_retention_days =
            parsed("WEBHOOK_RETENTION_DAYS", config.webhook_retention_days)?;
        config.invariant_lookback_hours =
            parsed("INVARIANT_LOOKBACK_HOURS", config.invariant_lookback_hours)?;
        config.pubsub = PubSubConfig::from_env()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SettlementResult<()> {
        if self.minimum_amount <= 0 {
            return Err(SettlementError::Config(
                "MINIMUM_AMOUNT_CENTS must be positive".to_string(),
            ));
        }
        if self.platform_fee_bps > 10_000 {
            return Err(SettlementError::Config(
                "PLATFORM_FEE_BPS must not exceed 10000".to_string(),
            ));
        }
        bounded(
            "WEBHOOK_TOLERANCE_SECS",
            self.webhook_tolerance_secs,
            1,
            MAX_WEBHOOK_TOLERANCE_SECS,
        )?;
        bounded(
            "INVARIANT_LOOKBACK_HOURS",
            self.invariant_lookback_hours,
            1,
            MAX_INVARIANT_LOOKBACK_HOURS,
        )?;
        // Shorter than the gateway's redelivery window would let replays through
        bounded(
            "WEBHOOK_RETENTION_DAYS",
            self.webhook_retention_days,
            3,
            MAX_WEBHOOK_RETENTION_DAYS,
        )?;
        Ok(())
    }
}

fn bounded(key: &str, value: i64, min: i64, max: i64) -> SettlementResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SettlementError::Config(format!(
            "{} must be between {} and {}, got {}",
            key, min, max, value
        )))
    }
}

fn required(key: &str) -> SettlementResult<String> {
    optional(key).ok_or_else(|| SettlementError::Config(format!("{} not set", key)))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> SettlementResult<T> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SettlementError::Config(format!("{} is not a valid value: {}", key, raw))),
        None => Ok(default),
    }
}
