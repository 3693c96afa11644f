//! Replica Server
//!
//! HTTP API for the reply pipeline.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replica::{
    api::{self, AppState},
    ChatCompletionsClient, Config, Embedder, FastEmbedder, ReplyOrchestrator, SqliteStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; a missing API key is fatal at startup
    let config = Config::from_env()?;
    config.require_api_key()?;
    config.ensure_dirs()?;
    tracing::info!("Data directory: {:?}", config.data_dir);

    // Initialize components
    let store = Arc::new(SqliteStorage::new(&config)?);
    store.ping()?;

    let embedder: Option<Arc<dyn Embedder>> = if config.rag_enabled {
        let embed_config = config.clone();
        match tokio::task::spawn_blocking(move || FastEmbedder::new(&embed_config)).await? {
            Ok(embedder) => Some(Arc::new(embedder) as Arc<dyn Embedder>),
            Err(e) => {
                tracing::warn!(error = %e, "embedding model unavailable, replies will run without exemplars");
                None
            }
        }
    } else {
        tracing::info!("RAG disabled, skipping embedding model");
        None
    };

    let llm = Arc::new(ChatCompletionsClient::new(&config)?);
    tracing::info!(model = %llm.model(), "language model configured");

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let orchestrator = Arc::new(ReplyOrchestrator::new(config, store, embedder, llm)?);

    let app = api::router(AppState::new(orchestrator.clone()));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    orchestrator.shutdown();
    Ok(())
}
