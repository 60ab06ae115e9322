//! Main Entrypoint for the Voxbridge API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the broker negotiator and the single connection manager.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use voxbridge_api::{config::Config, router::create_router, state::AppState};
use voxbridge_core::{BrokerNegotiator, ConnectionManager, ProviderKeySource};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing connection manager...");

    // --- 3. Initialize the Session Core ---
    let negotiator = Arc::new(
        BrokerNegotiator::new(config.broker_config())
            .context("Failed to build broker HTTP client")?,
    );
    let provider_key = ProviderKeySource::new(config.openai_api_key.clone());
    if !provider_key.is_present() {
        info!("No provider key configured; connect requests will be refused until one is set.");
    }
    let manager = ConnectionManager::new(negotiator, config.session_profile(), provider_key);

    let app_state = Arc::new(AppState {
        manager: manager.clone(),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        broker_url = %config.broker_url,
        transport_address = %config.transport_address,
        agent_id = %config.agent_id,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    manager.disconnect().await;
    info!("Server has shut down.");
    Ok(())
}
