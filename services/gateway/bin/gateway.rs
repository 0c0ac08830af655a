//! Main Entrypoint for the Receptionist Voice Gateway
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the booking tool dispatcher and shared state.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Serving until `Ctrl+C`, then draining live calls before exiting.

use anyhow::Context;
use receptionist_core::{booking::StubBookingService, tools::ToolDispatcher};
use receptionist_gateway::{
    config::Config, registry::SessionRegistry, router::create_router, state::AppState,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Waits for `Ctrl+C`, then stops the registry from taking new calls and
/// tells the live ones to drain.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Draining calls...");
    registry.shutdown();
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
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let dispatcher = ToolDispatcher::new(Arc::new(StubBookingService));
    let app_state = Arc::new(AppState::new(config.clone(), dispatcher));
    let registry = Arc::clone(&app_state.registry);

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        model = %config.realtime_model,
        voice = %config.voice,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&registry)))
    .await?;

    let bound = config.drain_timeout + config.close_grace + Duration::from_secs(1);
    if registry.wait_idle(bound).await {
        info!("All calls finished.");
    } else {
        let counts = registry.counts();
        warn!(active = counts.active, "Calls still open after the drain bound, exiting anyway");
    }

    info!("Server has shut down.");
    Ok(())
}
