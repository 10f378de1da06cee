// Social Sentiment Server - analysis pipeline behind a JSON API

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use social_sentiment::{
    analytics_interface::create_api_router,
    app_state::AppState,
    config::Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize application state (database, config defaults, collaborators)
    let app_state = AppState::new(config.clone()).await?;
    info!(backend = app_state.db.backend_name(), "application state ready");

    // Build main application router
    let app = Router::new()
        .nest("/api", create_api_router(app_state))
        .layer(CorsLayer::permissive());

    // Start server
    let addr = config.server_address();
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "social sentiment server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
