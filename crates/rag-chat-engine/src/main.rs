use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rag_chat_engine::config::Settings;
use rag_chat_engine::database::{DbPool, Repository};
use rag_chat_engine::handlers::build_router;
use rag_chat_engine::logging::{ActivityLogger, LoggerConfig};
use rag_chat_engine::services::{EmbeddingService, LlmService, PgVectorStore};
use rag_chat_engine::state::AppState;
use rag_chat_engine::{EngineConfig, Gateways, RagOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rag_chat_engine=debug")),
        )
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("🚀 Starting RAG chat engine...");

    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    info!("✅ Database connection established");

    let repository = Arc::new(Repository::new(db_pool.clone()));
    repository.ensure_schema(settings.embedding.dimension).await?;

    let llm_service = Arc::new(LlmService::new(settings.llm.clone())?);
    let embedding_service = Arc::new(EmbeddingService::new(&settings.embedding)?);
    let vector_store = Arc::new(PgVectorStore::new(repository.clone(), embedding_service));

    let logger = if settings.activity_log.enabled {
        ActivityLogger::new(repository.clone(), LoggerConfig::from(&settings.activity_log))
    } else {
        ActivityLogger::disabled()
    };

    let engine = Arc::new(RagOrchestrator::new(
        Gateways {
            llm: llm_service,
            vectors: vector_store,
            store: repository,
        },
        EngineConfig::from(&settings),
        logger,
    ));
    engine.start_reaper();
    info!("✅ Session reaper started");

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    let app = build_router(AppState {
        engine: engine.clone(),
        settings: Arc::new(settings),
    });

    info!("🎯 Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let flushed = engine.shutdown().await;
    info!("🛑 Shutdown complete, flushed {} sessions", flushed);
    db_pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
