// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps SettlementError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CreatorPay API Library
//!
//! HTTP surface over the settlement service: payment intents, refunds,
//! subscriptions, orders, earnings, gateway webhooks and channel streams.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod edge_case_tests;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
