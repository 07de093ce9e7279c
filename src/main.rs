//! relaychat - two-party real-time chat relay server

use relaychat::api::{build_router, AppState};
use relaychat::auth::{JwtConfig, TokenAuth};
use relaychat::db::Database;
use relaychat::registry::ConnectionRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaychat=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("RELAYCHAT_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.relaychat/relaychat.db")
    });

    let port: u16 = std::env::var("RELAYCHAT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let jwt = JwtConfig {
        secret: std::env::var("RELAYCHAT_JWT_SECRET")
            .map_err(|_| "RELAYCHAT_JWT_SECRET must be set")?,
        issuer: std::env::var("RELAYCHAT_JWT_ISSUER").unwrap_or_else(|_| "relaychat".into()),
        audience: std::env::var("RELAYCHAT_JWT_AUDIENCE")
            .unwrap_or_else(|_| "relaychat-clients".into()),
    };

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // Create application state
    let state = AppState::new(db, TokenAuth::new(&jwt));
    let registry = Arc::clone(&state.registry);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("relaychat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

/// Wait for ctrl-c, then close every live chat socket before the server stops
async fn shutdown_signal(registry: Arc<ConnectionRegistry>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested, closing live connections");
    registry.shutdown_all();
}
