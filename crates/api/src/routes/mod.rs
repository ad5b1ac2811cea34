//! API routes

mod channels;
mod earnings;
mod health;
mod orders;
mod payments;
mod refunds;
mod subscriptions;
mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        // Payments
        .route("/payments/intents", post(payments::create_payment_intent))
        .route("/refunds", post(refunds::issue_refund))
        // Gateway webhooks (signature-verified, no other auth)
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        // Subscriptions
        .route("/subscriptions", post(subscriptions::subscribe))
        .route("/subscriptions/{id}/cancel", post(subscriptions::cancel))
        // Orders
        .route("/orders/{id}", get(orders::get_order))
        .route("/orders/{id}/accept", post(orders::accept))
        .route("/orders/{id}/deliver", post(orders::deliver))
        .route("/orders/{id}/decline", post(orders::decline))
        // Reporting
        .route("/creators/{creator_id}/earnings", get(earnings::creator_earnings))
        // Channels
        .route("/channels/{channel}/events", get(channels::stream_channel))
        .route("/announcements", post(channels::announce))
        .with_state(state)
}
