use axum::{routing::get, Router};
use homehub::config::{ColdStoreKind, Config};
use homehub::db::{self, ColdStore, MemoryColdStore, PgColdStore};
use homehub::hub::{Hub, HubOptions};
use homehub::{aggregator, ledger, metrics, mqtt, rest, router};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting home hub");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);

    // Initialize metrics
    metrics::init_metrics();

    let cold: Arc<dyn ColdStore> = match config.cold_store {
        ColdStoreKind::Postgres => {
            info!("Database: {}", config.redacted_database_url());
            match db::make_pool(&config.database_url).await {
                Ok(pool) => Arc::new(PgColdStore::new(pool)),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            }
        }
        ColdStoreKind::Memory => {
            warn!("Using in-memory cold tier; history does not survive restarts");
            Arc::new(MemoryColdStore::new())
        }
    };

    let (publisher, connection) = mqtt::connect(&config);
    let hub = Arc::new(Hub::new(HubOptions::from(&config), Arc::new(publisher), cold.clone()));

    // Bounded queue between the transport and the router
    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(connection, tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let router_handle = tokio::spawn(router::run_router(rx, hub.clone()));

    let sweeper_handle = tokio::spawn(ledger::run_sweeper(hub.clone(), config.sweep_interval));

    let aggregator_handle = tokio::spawn(aggregator::run_aggregator(
        hub.hot.clone(),
        cold,
        config.aggregate_interval,
        config.bucket_width_ms,
    ));

    // Build HTTP app with REST API, WebSocket and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(hub));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = router_handle => {
            error!("Router task terminated");
        }
        _ = sweeper_handle => {
            error!("Sweeper task terminated");
        }
        _ = aggregator_handle => {
            error!("Aggregator task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
