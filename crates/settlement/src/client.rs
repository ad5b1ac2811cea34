//! Stripe gateway adapter

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    Account, AccountId, CancelSubscription, CreatePaymentIntent,
    CreatePaymentIntentAutomaticPaymentMethods, CreatePaymentIntentTransferData, CreatePrice,
    CreatePriceRecurring, CreatePriceRecurringInterval, CreateProduct, CreateRefund,
    CreateSubscription, CreateSubscriptionItems, CreateSubscriptionTransferData, Currency,
    CustomerId, IdOrCreate, PaymentIntent, PaymentIntentId, Price, Product, Refund,
    RefundReasonFilter, StripeError, Subscription, SubscriptionId,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::StripeConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::gateway::{
    CreatedPaymentIntent, GatewayAccount, GatewayRefund, GatewaySubscription, PaymentGateway,
    PaymentIntentRequest, RecurringPrice, RecurringPriceRequest, RefundRequest,
    SubscriptionRequest,
};
use crate::refund::RefundReason;
use crate::subscriptions::{BillingInterval, SubscriptionStatus};

/// Thin wrapper over `stripe::Client` holding the credentials it was built from
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Network failures, rate limiting and gateway-side errors
fn is_transient(error: &StripeError) -> bool {
    match error {
        StripeError::Stripe(err) => err.http_status == 429 || err.http_status >= 500,
        StripeError::ClientError(_) | StripeError::Timeout => true,
        _ => false,
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn retrieve_account(&self, account_id: &str) -> SettlementResult<Option<GatewayAccount>> {
        let id = match account_id.parse::<AccountId>() {
            Ok(id) => id,
            // Not even shaped like an account id
            Err(_) => return Ok(None),
        };

        // Reads are safe to repeat; writes go out once and surface their error
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(2);
        let retrieved = RetryIf::spawn(
            strategy,
            || Account::retrieve(&self.inner, &id, &[]),
            is_transient,
        )
        .await;

        match retrieved {
            Ok(account) => Ok(Some(GatewayAccount {
                id: account.id.to_string(),
                charges_enabled: account.charges_enabled.unwrap_or(false),
                payouts_enabled: account.payouts_enabled.unwrap_or(false),
            })),
            Err(StripeError::Stripe(err)) if err.http_status == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> SettlementResult<CreatedPaymentIntent> {
        let mut params = CreatePaymentIntent::new(request.amount, currency(&request.currency)?);
        params.application_fee_amount = Some(request.application_fee_amount);
        params.transfer_data = Some(CreatePaymentIntentTransferData {
            amount: None,
            destination: request.destination_account.clone(),
        });
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            allow_redirects: None,
            enabled: true,
        });
        params.metadata = Some(request.metadata);

        let intent = PaymentIntent::create(&self.inner, params).await?;

        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            SettlementError::Gateway(format!(
                "Payment intent {} returned without a client secret",
                intent.id
            ))
        })?;

        Ok(CreatedPaymentIntent {
            id: intent.id.to_string(),
            client_secret,
            amount: intent.amount,
        })
    }

    async fn create_refund(&self, request: RefundRequest) -> SettlementResult<GatewayRefund> {
        let payment_intent = request
            .payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| SettlementError::InvalidInput(format!("Invalid payment intent ID: {}", e)))?;

        let mut params = CreateRefund::new();
        params.payment_intent = Some(payment_intent);
        params.amount = Some(request.amount);
        params.reason = Some(match request.reason {
            RefundReason::RequestedByCustomer => RefundReasonFilter::RequestedByCustomer,
            RefundReason::Duplicate => RefundReasonFilter::Duplicate,
            RefundReason::Fraudulent => RefundReasonFilter::Fraudulent,
        });
        params.reverse_transfer = Some(request.reverse_transfer);
        params.refund_application_fee = Some(request.refund_application_fee);
        params.metadata = Some(request.metadata);

        let refund = Refund::create(&self.inner, params).await?;

        Ok(GatewayRefund {
            id: refund.id.to_string(),
            amount: refund.amount,
            status: refund.status.as_deref().unwrap_or("pending").to_string(),
        })
    }

    async fn create_recurring_price(
        &self,
        request: RecurringPriceRequest,
    ) -> SettlementResult<RecurringPrice> {
        let mut product_params = CreateProduct::new(&request.product_name);
        product_params.metadata = Some(request.metadata.clone());
        let product = Product::create(&self.inner, product_params).await?;

        let mut params = CreatePrice::new(currency(&request.currency)?);
        params.product = Some(IdOrCreate::Id(product.id.as_str()));
        params.unit_amount = Some(request.unit_amount);
        params.recurring = Some(CreatePriceRecurring {
            interval: match request.interval {
                BillingInterval::Day => CreatePriceRecurringInterval::Day,
                BillingInterval::Week => CreatePriceRecurringInterval::Week,
                BillingInterval::Month => CreatePriceRecurringInterval::Month,
                BillingInterval::Year => CreatePriceRecurringInterval::Year,
            },
            interval_count: None,
            aggregate_usage: None,
            trial_period_days: None,
            usage_type: None,
        });
        params.metadata = Some(request.metadata);

        let price = Price::create(&self.inner, params).await?;

        Ok(RecurringPrice {
            product_id: product.id.to_string(),
            price_id: price.id.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> SettlementResult<GatewaySubscription> {
        let customer_id = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| SettlementError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.application_fee_percent = Some(request.application_fee_percent);
        params.transfer_data = Some(CreateSubscriptionTransferData {
            amount_percent: None,
            destination: request.destination_account.clone(),
        });
        params.metadata = Some(request.metadata);

        let subscription = Subscription::create(&self.inner, params).await?;
        map_subscription(&subscription)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prorate: bool,
    ) -> SettlementResult<GatewaySubscription> {
        let id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|_| SettlementError::SubscriptionNotFound(subscription_id.to_string()))?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: Some(prorate),
        };

        let subscription = Subscription::cancel(&self.inner, &id, params).await?;
        map_subscription(&subscription)
    }
}

fn currency(code: &str) -> SettlementResult<Currency> {
    match code.to_lowercase().as_str() {
        "usd" => Ok(Currency::USD),
        "eur" => Ok(Currency::EUR),
        "gbp" => Ok(Currency::GBP),
        "cad" => Ok(Currency::CAD),
        "aud" => Ok(Currency::AUD),
        "jpy" => Ok(Currency::JPY),
        other => Err(SettlementError::Config(format!(
            "Unsupported settlement currency: {}",
            other
        ))),
    }
}

fn map_subscription(subscription: &Subscription) -> SettlementResult<GatewaySubscription> {
    let status = subscription
        .status
        .as_str()
        .parse::<SubscriptionStatus>()
        .map_err(|e| SettlementError::Gateway(e.to_string()))?;

    Ok(GatewaySubscription {
        id: subscription.id.to_string(),
        status,
        current_period_start: timestamp(subscription.current_period_start)?,
        current_period_end: timestamp(subscription.current_period_end)?,
        canceled_at: subscription.canceled_at.map(timestamp).transpose()?,
        cancel_at_period_end: subscription.cancel_at_period_end,
    })
}

pub(crate) fn timestamp(secs: i64) -> SettlementResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| SettlementError::Gateway(format!("Invalid timestamp {}: {}", secs, e)))
}

/// Metadata keys attached to every gateway object this crate creates
pub(crate) fn tagged(
    mut metadata: HashMap<String, String>,
    creator_id: &str,
    payer_id: &str,
) -> HashMap<String, String> {
    metadata.insert("creator_id".to_string(), creator_id.to_string());
    metadata.insert("payer_id".to_string(), payer_id.to_string());
    metadata
}
