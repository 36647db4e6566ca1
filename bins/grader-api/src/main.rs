mod handlers;
mod routes;

use axum::Router;
use grader_core::LanguageConfigManager;
use redis::aio::ConnectionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub languages: LanguageConfigManager,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Grader API booting...");

    let languages_path = std::env::var("GRADER_LANGUAGES_CONFIG").ok().map(PathBuf::from);
    let languages = LanguageConfigManager::resolve(languages_path.as_deref()).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;

    info!("Accepting languages: {:?}", languages.list_languages());

    // Connect to Redis
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let client = redis::Client::open(redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", redis_url);

    let state = Arc::new(AppState {
        redis: redis_conn,
        languages,
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let addr = std::env::var("GRADER_API_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app).await?;
    Ok(())
}
