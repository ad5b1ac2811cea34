//! Gateway webhook events
//!
//! Only the fields settlement acts on are decoded. Event types outside the
//! handled set become [`GatewayEventKind::Unhandled`] and are recorded without
//! further processing.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::client::timestamp;
use crate::error::{SettlementError, SettlementResult};

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Set when the intent collects an invoice, i.e. a subscription charge
    #[serde(default)]
    pub invoice: Option<String>,
    pub last_payment_error: Option<PaymentError>,
}

impl PaymentIntentObject {
    /// One-off charges this platform created carry the creator in metadata.
    /// Invoice charges settle through `invoice.paid` instead.
    pub fn is_marketplace_charge(&self) -> bool {
        self.invoice.is_none() && self.metadata.contains_key("creator_id")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemObject {
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListObject<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for ListObject<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: ListObject<SubscriptionItemObject>,
}

impl SubscriptionObject {
    /// Current period, falling back to the first item where newer API
    /// versions moved it
    pub fn period(&self) -> (Option<i64>, Option<i64>) {
        let item = self.items.data.first();
        (
            self.current_period_start
                .or_else(|| item.and_then(|i| i.current_period_start)),
            self.current_period_end
                .or_else(|| item.and_then(|i| i.current_period_end)),
        )
    }

    /// Subscriptions this platform created carry the creator in metadata
    pub fn is_marketplace(&self) -> bool {
        self.metadata.contains_key("creator_id")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinePeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLineObject {
    pub period: Option<LinePeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    pub subscription: Option<String>,
    /// Snapshot of the subscription's metadata when the invoice was cut
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    pub subscription: Option<String>,
    pub parent: Option<InvoiceParent>,
    /// Older API versions put the subscription snapshot at the top level
    pub subscription_details: Option<SubscriptionDetails>,
    pub payment_intent: Option<String>,
    pub amount_paid: i64,
    pub currency: String,
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub lines: ListObject<InvoiceLineObject>,
}

impl InvoiceObject {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    /// Invoices of subscriptions this platform created carry the creator in
    /// the subscription snapshot
    pub fn is_marketplace(&self) -> bool {
        self.subscription_details
            .iter()
            .chain(
                self.parent
                    .as_ref()
                    .and_then(|p| p.subscription_details.as_ref()),
            )
            .any(|d| d.metadata.contains_key("creator_id"))
    }

    /// Ledger key for the invoice's payment; the invoice id when the gateway
    /// does not expose the payment intent
    pub fn payment_key(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }

    pub fn period(&self) -> Option<(i64, i64)> {
        self.lines
            .data
            .first()
            .and_then(|line| line.period.as_ref())
            .map(|p| (p.start, p.end))
    }
}

/// The closed set of events settlement reacts to
#[derive(Debug, Clone)]
pub enum GatewayEventKind {
    PaymentSucceeded(PaymentIntentObject),
    PaymentFailed(PaymentIntentObject),
    /// `customer.subscription.created` and `customer.subscription.updated`
    SubscriptionChanged(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    Unhandled,
}

#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub kind: GatewayEventKind,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

impl GatewayEvent {
    pub fn parse(payload: &str) -> SettlementResult<Self> {
        let raw: RawEvent = serde_json::from_str(payload)
            .map_err(|e| SettlementError::InvalidInput(format!("Malformed webhook event: {}", e)))?;

        let object = raw.data.object;
        let kind = match raw.event_type.as_str() {
            "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded(decode(object)?),
            "payment_intent.payment_failed" => GatewayEventKind::PaymentFailed(decode(object)?),
            "customer.subscription.created" | "customer.subscription.updated" => {
                GatewayEventKind::SubscriptionChanged(decode(object)?)
            }
            "customer.subscription.deleted" => GatewayEventKind::SubscriptionDeleted(decode(object)?),
            "invoice.paid" => GatewayEventKind::InvoicePaid(decode(object)?),
            _ => GatewayEventKind::Unhandled,
        };

        Ok(Self {
            id: raw.id,
            created: timestamp(raw.created)?,
            event_type: raw.event_type,
            kind,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: serde_json::Value) -> SettlementResult<T> {
    serde_json::from_value(object)
        .map_err(|e| SettlementError::InvalidInput(format!("Malformed event object: {}", e)))
}
