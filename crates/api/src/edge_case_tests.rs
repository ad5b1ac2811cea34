// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the HTTP surface
//!
//! Drives the router end to end with in-memory doubles:
//! - Request validation and error bodies
//! - Webhook signature handling and acknowledgements
//! - Order lifecycle and earnings over HTTP
//! - Channel streaming availability

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use creatorpay_settlement::testing::{
        event_payload, signature_header, video_intent, MockGateway, RecordingPublisher,
    };
    use creatorpay_settlement::{
        BroadcastHub, ChannelPublisher, MemoryLedger, SettlementConfig, SettlementService,
        StripeConfig,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{create_router, AppState};

    pub const WEBHOOK_SECRET: &str = "whsec_api_edge_secret";

    pub struct TestApp {
        pub router: Router,
        pub gateway: Arc<MockGateway>,
        pub hub: Option<BroadcastHub>,
        pub settlement: Arc<SettlementService>,
    }

    /// App wired to an in-process hub, like a deployment without pub/sub
    pub async fn app() -> TestApp {
        build(true).await
    }

    /// App publishing elsewhere, like a deployment with pub/sub configured
    pub async fn app_without_hub() -> TestApp {
        build(false).await
    }

    async fn build(with_hub: bool) -> TestApp {
        let gateway = Arc::new(MockGateway::new());
        gateway.add_account("acct_ready", true, true).await;
        gateway.add_account("acct_restricted", true, false).await;

        let hub = with_hub.then(BroadcastHub::new);
        let publisher: Arc<dyn ChannelPublisher> = match &hub {
            Some(hub) => Arc::new(hub.clone()),
            None => Arc::new(RecordingPublisher::new()),
        };

        let config = SettlementConfig::new(StripeConfig {
            secret_key: "sk_test_api".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
        });
        let settlement = SettlementService::new(
            config,
            gateway.clone(),
            Arc::new(MemoryLedger::new()),
            publisher,
        )
        .unwrap();

        let state = AppState::new(settlement, hub.clone());
        TestApp {
            settlement: state.settlement.clone(),
            router: create_router(state),
            gateway,
            hub,
        }
    }

    impl TestApp {
        pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, body)
        }

        pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            self.send(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
            self.send(Request::get(uri).body(Body::empty()).unwrap()).await
        }

        pub async fn create_payment(&self, amount: i64) -> (StatusCode, Value) {
            self.post_json(
                "/payments/intents",
                serde_json::json!({
                    "creatorId": "creator_1",
                    "creatorAccountId": "acct_ready",
                    "payerId": "fan_1",
                    "amount": amount,
                    "metadata": { "instructions": "Happy birthday, Alex" },
                }),
            )
            .await
        }

        /// Deliver a correctly signed gateway event
        pub async fn webhook(&self, event_id: &str, event_type: &str, object: Value) -> (StatusCode, Value) {
            let created = time::OffsetDateTime::now_utc().unix_timestamp();
            let payload = event_payload(event_id, event_type, created, object);
            let signature = signature_header(WEBHOOK_SECRET, &payload);
            let response = self
                .send(
                    Request::post("/webhooks/gateway")
                        .header("Stripe-Signature", signature)
                        .body(Body::from(payload))
                        .unwrap(),
                )
                .await;
            self.settlement.webhooks.flush_notifications().await;
            response
        }

        /// Create and confirm a payment; returns its intent id
        pub async fn completed_payment(&self, amount: i64) -> String {
            let (_, body) = self.create_payment(amount).await;
            let payment_intent_id = body["paymentIntentId"].as_str().unwrap().to_string();
            let (status, _) = self
                .webhook(
                    &format!("evt_paid_{}", payment_intent_id),
                    "payment_intent.succeeded",
                    video_intent(&payment_intent_id, amount),
                )
                .await;
            assert_eq!(status, StatusCode::OK);
            payment_intent_id
        }
    }
}

// =============================================================================
// Payment Request Validation
// =============================================================================

#[cfg(test)]
mod payment_tests {
    use axum::http::StatusCode;

    use super::support::*;

    #[tokio::test]
    async fn test_create_payment_returns_split() {
        let app = app().await;

        let (status, body) = app.create_payment(10_000).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["amount"], 10_000);
        assert_eq!(body["platformFee"], 3_000);
        assert_eq!(body["creatorEarnings"], 7_000);
        assert!(body["clientSecret"].as_str().unwrap().ends_with("_secret"));
        assert_eq!(app.gateway.payment_intents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_amount_below_minimum_is_400() {
        let app = app().await;

        let (status, body) = app.create_payment(50).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_amount");
        assert!(app.gateway.payment_intents().await.is_empty());
    }

    #[tokio::test]
    async fn test_restricted_account_is_422() {
        let app = app().await;

        let (status, body) = app
            .post_json(
                "/payments/intents",
                serde_json::json!({
                    "creatorId": "creator_1",
                    "creatorAccountId": "acct_restricted",
                    "payerId": "fan_1",
                    "amount": 10_000,
                }),
            )
            .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "account_not_ready");
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_shape() {
        let app = app().await;

        let (status, body) = app
            .post_json("/payments/intents", serde_json::json!({ "amount": "lots" }))
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_gateway_failure_is_502_without_details() {
        let app = app().await;
        app.gateway.fail_next("card_declined: secret internals").await;

        let (status, body) = app.create_payment(10_000).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "gateway_error");
        assert!(!body["message"].as_str().unwrap().contains("secret internals"));
    }
}

// =============================================================================
// Webhook Endpoint
// =============================================================================

#[cfg(test)]
mod webhook_tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use creatorpay_settlement::testing::video_intent;

    use super::support::*;

    #[tokio::test]
    async fn test_missing_signature_header_is_400() {
        let app = app().await;

        let (status, body) = app
            .send(
                Request::post("/webhooks/gateway")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_wrong_signature_is_400() {
        let app = app().await;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let (status, body) = app
            .send(
                Request::post("/webhooks/gateway")
                    .header("Stripe-Signature", format!("t={},v1=deadbeef", now))
                    .body(Body::from(r#"{"id":"evt_1"}"#))
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_signature");
    }

    #[tokio::test]
    async fn test_success_then_redelivery_is_acknowledged_once() {
        let app = app().await;
        let (_, created) = app.create_payment(10_000).await;
        let pi = created["paymentIntentId"].as_str().unwrap().to_string();
        let object = video_intent(&pi, 10_000);

        let (status, first) = app
            .webhook("evt_once", "payment_intent.succeeded", object.clone())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["received"], true);
        assert_eq!(first["outcome"], "applied");

        let (status, second) = app
            .webhook("evt_once", "payment_intent.succeeded", object)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["outcome"], "duplicate");
    }

    #[tokio::test]
    async fn test_unknown_payment_intent_is_500_for_redelivery() {
        let app = app().await;

        let (status, body) = app
            .webhook(
                "evt_orphan",
                "payment_intent.succeeded",
                video_intent("pi_never_created", 10_000),
            )
            .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "consistency_fault");
    }

    #[tokio::test]
    async fn test_subscription_charge_is_acknowledged_without_a_row() {
        let app = app().await;
        let mut alerts = app.hub.as_ref().unwrap().subscribe("admin-alerts").await;

        let (status, body) = app
            .webhook(
                "evt_renewal_charge",
                "payment_intent.succeeded",
                serde_json::json!({ "id": "pi_renewal", "amount": 999, "invoice": "in_renewal" }),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored");
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_acknowledged() {
        let app = app().await;

        let (status, body) = app
            .webhook("evt_misc", "customer.created", serde_json::json!({ "id": "cus_1" }))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored");
    }
}

// =============================================================================
// Refunds, Orders and Earnings
// =============================================================================

#[cfg(test)]
mod lifecycle_tests {
    use axum::http::StatusCode;
    use creatorpay_settlement::ChannelMessage;

    use super::support::*;

    #[tokio::test]
    async fn test_refund_over_balance_is_422() {
        let app = app().await;
        let pi = app.completed_payment(10_000).await;

        let (status, body) = app
            .post_json(
                "/refunds",
                serde_json::json!({ "paymentIntentId": pi, "amount": 10_001 }),
            )
            .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "refund_exceeds_balance");
        assert!(app.gateway.refund_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_refund_defaults() {
        let app = app().await;
        let pi = app.completed_payment(10_000).await;

        let (status, body) = app
            .post_json(
                "/refunds",
                serde_json::json!({ "paymentIntentId": pi, "amount": 4_000 }),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "partially_refunded");
        assert_eq!(body["remaining"], 6_000);
        assert_eq!(body["reversedFee"], 0);

        let requests = app.gateway.refund_requests().await;
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].reverse_transfer);
    }

    #[tokio::test]
    async fn test_refund_unknown_payment_is_404() {
        let app = app().await;

        let (status, body) = app
            .post_json("/refunds", serde_json::json!({ "paymentIntentId": "pi_missing" }))
            .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "transaction_not_found");
    }

    #[tokio::test]
    async fn test_order_lifecycle_over_http() {
        let app = app().await;
        let mut creator_events = app.hub.as_ref().unwrap().subscribe("creator-creator_1").await;

        app.completed_payment(10_000).await;

        let message: ChannelMessage = creator_events.try_recv().unwrap();
        assert_eq!(message.event, "new_order");
        let order_id = message.data.data["orderId"].as_str().unwrap().to_string();

        let (status, order) = app.get(&format!("/orders/{}", order_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["status"], "pending");

        let (status, order) = app
            .post_json(&format!("/orders/{}/accept", order_id), serde_json::json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["status"], "accepted");

        let (status, order) = app
            .post_json(
                &format!("/orders/{}/deliver", order_id),
                serde_json::json!({ "videoUrl": "https://cdn.creatorpay.io/v/1.mp4" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["status"], "delivered");

        // Delivered is terminal
        let (status, body) = app
            .post_json(&format!("/orders/{}/decline", order_id), serde_json::json!({}))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "illegal_transition");
    }

    #[tokio::test]
    async fn test_unknown_order_is_404() {
        let app = app().await;

        let (status, body) = app
            .post_json(
                "/orders/6f1c2f4e-8a53-4c1b-9a57-0d7f4e2b9c11/accept",
                serde_json::json!({}),
            )
            .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "order_not_found");
    }

    #[tokio::test]
    async fn test_earnings_report() {
        let app = app().await;
        app.completed_payment(10_000).await;
        app.completed_payment(2_500).await;

        let (status, body) = app
            .get("/creators/creator_1/earnings?startDate=2000-01-01T00:00:00Z&endDate=2100-01-01T00:00:00Z")
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRevenue"], 12_500);
        assert_eq!(body["platformFees"], 3_750);
        assert_eq!(body["netEarnings"], 8_750);
        assert_eq!(body["transactionCount"], 2);
    }

    #[tokio::test]
    async fn test_earnings_rejects_bad_dates() {
        let app = app().await;

        let (status, _) = app
            .get("/creators/creator_1/earnings?startDate=yesterday&endDate=2100-01-01T00:00:00Z")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .get("/creators/creator_1/earnings?startDate=2026-02-01T00:00:00Z&endDate=2026-01-01T00:00:00Z")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[cfg(test)]
mod subscription_tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };

    use super::support::*;

    fn subscribe_body(interval: &str) -> serde_json::Value {
        serde_json::json!({
            "creatorId": "creator_1",
            "creatorAccountId": "acct_ready",
            "payerId": "fan_1",
            "payerCustomerId": "cus_fan_1",
            "tierName": "Gold",
            "amount": 1_500,
            "interval": interval,
        })
    }

    #[tokio::test]
    async fn test_subscribe_and_cancel_without_body() {
        let app = app().await;

        let (status, subscription) = app.post_json("/subscriptions", subscribe_body("month")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(subscription["status"], "active");
        let id = subscription["subscriptionId"].as_str().unwrap().to_string();

        let (status, canceled) = app
            .send(
                Request::post(format!("/subscriptions/{}/cancel", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["status"], "canceled");
        assert_eq!(app.gateway.cancellations().await, vec![(id, false)]);
    }

    #[tokio::test]
    async fn test_cancel_with_proration() {
        let app = app().await;
        let (_, subscription) = app.post_json("/subscriptions", subscribe_body("year")).await;
        let id = subscription["subscriptionId"].as_str().unwrap().to_string();

        let (status, _) = app
            .post_json(
                &format!("/subscriptions/{}/cancel", id),
                serde_json::json!({ "prorate": true }),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.gateway.cancellations().await, vec![(id, true)]);
    }

    #[tokio::test]
    async fn test_unknown_interval_is_400() {
        let app = app().await;

        let (status, body) = app.post_json("/subscriptions", subscribe_body("fortnight")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
        assert!(app.gateway.subscription_requests().await.is_empty());
    }
}

// =============================================================================
// Channels and Health
// =============================================================================

#[cfg(test)]
mod channel_tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::support::*;

    #[tokio::test]
    async fn test_known_channel_streams_events() {
        let app = app().await;

        let response = app
            .router
            .clone()
            .oneshot(
                Request::get("/channels/creator-creator_1/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[tokio::test]
    async fn test_closed_stream_releases_channel() {
        let app = app().await;
        let hub = app.hub.clone().unwrap();

        let response = app
            .router
            .clone()
            .oneshot(Request::get("/channels/fan-fan_9/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(hub.subscriber_count("fan-fan_9").await, 1);

        drop(response);
        for _ in 0..100 {
            if hub.channel_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_404() {
        let app = app().await;

        let (status, body) = app.get("/channels/somebody-else/events").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_streaming_absent_with_external_pubsub() {
        let app = app_without_hub().await;

        let (status, _) = app.get("/channels/all-creators/events").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_announcement_reaches_all_creators() {
        let app = app().await;
        let mut listener = app.hub.as_ref().unwrap().subscribe("all-creators").await;

        let (status, body) = app
            .post_json(
                "/announcements",
                serde_json::json!({ "title": "Payouts", "message": "Payouts run Friday" }),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let message = listener.try_recv().unwrap();
        assert_eq!(message.event, "platform_announcement");
        assert_eq!(message.data.title, "Payouts");
    }

    #[tokio::test]
    async fn test_blank_announcement_is_400() {
        let app = app().await;

        let (status, _) = app
            .post_json("/announcements", serde_json::json!({ "title": " ", "message": "x" }))
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;

        let (status, body) = app.get("/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
