use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nearby_transit::config::TrackerConfig;
use nearby_transit::providers::TransitClient;
use nearby_transit::sync::RefreshOrchestrator;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn".into()),
        )
        .init();

    // Load config
    let config = TrackerConfig::load("config.yaml").expect("Failed to load config");
    if let Err(e) = config.require_credentials() {
        tracing::warn!(error = %e, "No credentials configured, nothing will be fetched");
    }
    tracing::info!(agency_id = %config.agency_id, "Loaded configuration");

    // Broadcast channel for API request diagnostics (capacity 100)
    let (api_requests_tx, mut api_requests_rx) = broadcast::channel(100);

    let client =
        TransitClient::new(&config, api_requests_tx).expect("Failed to build transit client");

    let user_location = config.locations.fallback();
    if user_location.is_none() {
        tracing::warn!("No fallback location configured, snapshots will stay empty");
    }

    let orchestrator = Arc::new(RefreshOrchestrator::new(client, config));
    orchestrator.set_user_location(user_location).await;
    orchestrator.start_auto_refresh().await;

    // Log request diagnostics at debug level
    tokio::spawn(async move {
        while let Ok(log) = api_requests_rx.recv().await {
            tracing::debug!(
                endpoint = %log.endpoint,
                status = log.status,
                duration_ms = log.duration_ms,
                error = ?log.error,
                "API request"
            );
        }
    });

    // Print a snapshot summary every 15 seconds until interrupted
    let reporter = orchestrator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(15));
        loop {
            interval.tick().await;
            match reporter.snapshot().await {
                Some(snapshot) => {
                    for group in &snapshot.groups {
                        tracing::info!(
                            station = %group.station.station.name,
                            distance_m = group.station.distance.round(),
                            vehicles = group.vehicles.len(),
                            routes = group.all_routes.len(),
                            cached = snapshot.used_cached_data,
                            "Nearby station"
                        );
                    }
                    if snapshot.groups.is_empty() {
                        tracing::info!("No vehicles near the selected stations");
                    }
                }
                None => tracing::info!("Waiting for first data"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutting down");
    orchestrator.shutdown().await;
}
