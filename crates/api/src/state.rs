//! Application state

use std::sync::Arc;

use creatorpay_settlement::{BroadcastHub, SettlementService};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settlement: Arc<SettlementService>,
    /// In-process channel hub; `None` when events go to the external pub/sub service
    pub hub: Option<BroadcastHub>,
}

impl AppState {
    pub fn new(settlement: SettlementService, hub: Option<BroadcastHub>) -> Self {
        if hub.is_some() {
            tracing::info!("Channel events served in-process over SSE");
        } else {
            tracing::info!("Channel events published to external pub/sub service");
        }

        Self {
            settlement: Arc::new(settlement),
            hub,
        }
    }
}
