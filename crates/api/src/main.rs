//! CreatorPay API Server

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use creatorpay_api::{create_router, AppState, Config};
use creatorpay_settlement::{
    BroadcastHub, ChannelPublisher, HttpChannelPublisher, Ledger, MemoryLedger, PgLedger,
    SettlementService, StripeClient,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,creatorpay_api=debug,creatorpay_settlement=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    tracing::info!("Starting CreatorPay API Server v{}", env!("CARGO_PKG_VERSION"));

    let ledger: Arc<dyn Ledger> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let ledger = PgLedger::connect(url, config.database_max_connections).await?;
            ledger.migrate().await?;
            tracing::info!("Database connection established, migrations applied");
            Arc::new(ledger)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory ledger (data is lost on restart)");
            Arc::new(MemoryLedger::new())
        }
    };

    let (publisher, hub): (Arc<dyn ChannelPublisher>, Option<BroadcastHub>) =
        match config.settlement.pubsub.clone() {
            Some(pubsub) => (Arc::new(HttpChannelPublisher::new(pubsub)?), None),
            None => {
                let hub = BroadcastHub::new();
                (Arc::new(hub.clone()), Some(hub))
            }
        };

    let gateway = Arc::new(StripeClient::new(config.settlement.stripe.clone()));
    let settlement = SettlementService::new(config.settlement.clone(), gateway, ledger, publisher)?;
    tracing::info!(
        fee_bps = config.settlement.platform_fee_bps,
        currency = %config.settlement.currency,
        "Settlement service ready"
    );

    let state = AppState::new(settlement, hub);
    let settlement = state.settlement.clone();
    let app = create_router(state)
        .layer(cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Deliver notifications for webhooks acknowledged before shutdown
    settlement.webhooks.flush_notifications().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
