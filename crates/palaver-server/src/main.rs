use anyhow::Result;
use palaver_server::state;
use palaver_server::stores::{MemoryCommunityStore, MemoryMessageStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palaver_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Palaver voice server...");

    // Load configuration
    let config = state::Config::load()?;
    let bind_address = config.bind_address.clone();

    // The dev binary runs against in-memory stores; deployments wire in the
    // real community and message services here.
    let communities = Arc::new(MemoryCommunityStore::new());
    let messages = Arc::new(MemoryMessageStore::new());
    let (app, _state) = palaver_server::create_app(config, communities, messages)?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
