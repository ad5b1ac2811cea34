// Settlement crate clippy configuration
#![allow(clippy::result_large_err)] // SettlementError carries gateway/account context
#![allow(clippy::too_many_arguments)] // Service constructors wire several ports
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CreatorPay Settlement Module
//!
//! Money movement for the creator marketplace: fans pay creators, the
//! platform keeps its fee, and both sides are told what happened.
//!
//! ## Features
//!
//! - **Payments**: Destination charges with an application fee, pending until the gateway confirms
//! - **Webhooks**: Signature-verified, idempotent, order-tolerant event processing
//! - **Refunds**: Full and partial refunds with proportional fee reversal
//! - **Subscriptions**: Recurring creator tiers billed by the gateway
//! - **Orders**: Video request lifecycle opened by a completed payment
//! - **Earnings**: Per-creator revenue reports
//! - **Notifications**: Real-time channel fan-out (creator, fan, broadcast, admin)
//! - **Invariants**: Scheduled ledger consistency checks

pub mod accounts;
pub mod client;
pub mod config;
pub mod earnings;
pub mod error;
pub mod events;
pub mod fees;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod notifications;
pub mod order;
pub mod payments;
pub mod publisher;
pub mod refund;
pub mod subscriptions;
pub mod transaction;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


use std::sync::Arc;

// Accounts
pub use accounts::{AccountValidator, CreatorPayoutAccount};

// Gateway
pub use client::StripeClient;
pub use gateway::{GatewayAccount, PaymentGateway};

// Config
pub use config::{ChannelNaming, PubSubConfig, SettlementConfig, StripeConfig};

// Earnings
pub use earnings::{EarningsAggregator, EarningsReport, EarningsTotals};

// Error
pub use error::{ErrorKind, SettlementError, SettlementResult};

// Events
pub use events::{GatewayEvent, GatewayEventKind};

// Fees
pub use fees::{FeeCalculator, FeeSplit};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Ledger
pub use ledger::{Ledger, MemoryLedger, PgLedger};

// Notifications
pub use notifications::{EventName, NotificationPayload, Notifier, NotifyOutcome, Severity};

// Orders
pub use order::{Order, OrderService, OrderStatus};

// Payments
pub use payments::{CreatePayment, PaymentService, PendingPayment};

// Publishers
pub use publisher::{BroadcastHub, ChannelMessage, ChannelPublisher, HttpChannelPublisher};

// Refunds
pub use refund::{IssueRefund, RefundReason, RefundResult, RefundService};

// Subscriptions
pub use subscriptions::{
    BillingInterval, SubscribeRequest, Subscription, SubscriptionService, SubscriptionStatus,
};

// Transactions
pub use transaction::{Transaction, TransactionStatus, TransactionType};

// Webhooks
pub use webhooks::{verify_signature, WebhookOutcome, WebhookProcessor};

/// Every settlement component wired against one gateway, ledger and publisher
pub struct SettlementService {
    pub payments: PaymentService,
    pub webhooks: WebhookProcessor,
    pub refunds: RefundService,
    pub subscriptions: SubscriptionService,
    pub orders: OrderService,
    pub earnings: EarningsAggregator,
    pub invariants: InvariantChecker,
    pub accounts: AccountValidator,
    pub notifier: Notifier,
    pub ledger: Arc<dyn Ledger>,
    config: SettlementConfig,
}

impl SettlementService {
    pub fn new(
        config: SettlementConfig,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn Ledger>,
        publisher: Arc<dyn ChannelPublisher>,
    ) -> SettlementResult<Self> {
        config.validate()?;
        let fees = FeeCalculator::new(config.platform_fee_bps)?;
        let notifier = Notifier::new(publisher, config.channels.clone());

        Ok(Self {
            payments: PaymentService::new(
                gateway.clone(),
                ledger.clone(),
                fees,
                config.currency.clone(),
                config.minimum_amount,
            ),
            webhooks: WebhookProcessor::new(
                ledger.clone(),
                notifier.clone(),
                fees,
                config.stripe.webhook_secret.clone(),
                config.webhook_tolerance_secs,
            ),
            refunds: RefundService::new(gateway.clone(), ledger.clone(), fees, notifier.clone()),
            subscriptions: SubscriptionService::new(
                gateway.clone(),
                ledger.clone(),
                fees,
                notifier.clone(),
                config.currency.clone(),
                config.minimum_amount,
            ),
            orders: OrderService::new(ledger.clone(), notifier.clone()),
            earnings: EarningsAggregator::new(ledger.clone()),
            invariants: InvariantChecker::new(
                ledger.clone(),
                notifier.clone(),
                time::Duration::hours(config.invariant_lookback_hours),
            ),
            accounts: AccountValidator::new(gateway),
            notifier,
            ledger,
            config,
        })
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Drop processed webhook records past the retention window
    pub async fn prune_webhook_records(&self) -> SettlementResult<u64> {
        let cutoff =
            time::OffsetDateTime::now_utc() - time::Duration::days(self.config.webhook_retention_days);
        let pruned = self.ledger.prune_webhook_records(cutoff).await?;
        tracing::info!(
            pruned = pruned,
            retention_days = self.config.webhook_retention_days,
            "Pruned processed webhook records"
        );
        Ok(pruned)
    }
}
