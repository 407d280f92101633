use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use ragdesk::{
    ai::{HttpEmbedder, HttpGenerator},
    chunkstore::PgChunkStore,
    config::AppConfig,
    conversation::PgConversationStore,
    db,
    external::{ConnectionManager, SchemaCache},
    extract::PdfiumTextExtractor,
    jobs::PgJobQueue,
    repo::{PgDocumentStore, PgPermissionStore},
    state::AppState,
    storage::S3BlobStore,
    workers::{default_handlers, Worker},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        s3_bucket = %config.s3_bucket,
        "loaded configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    {
        let mut conn = pool.get().context("failed to get connection for migrations")?;
        db::run_migrations(&mut conn)?;
    }

    let blobs = Arc::new(S3BlobStore::from_config(&config).await?);
    let embedding_endpoint = config
        .embedding_endpoint
        .clone()
        .context("EMBEDDING_ENDPOINT must be set")?;
    let generation_endpoint = config
        .generation_endpoint
        .clone()
        .context("GENERATION_ENDPOINT must be set")?;

    let poll_interval = config.worker_poll_interval;
    let state = Arc::new(AppState {
        documents: Arc::new(PgDocumentStore::new(pool.clone())),
        permissions: Arc::new(PgPermissionStore::new(pool.clone())),
        conversations: Arc::new(PgConversationStore::new(pool.clone())),
        chunks: Arc::new(PgChunkStore::new(pool.clone())),
        queue: Arc::new(PgJobQueue::new(pool)),
        blobs,
        extractor: Arc::new(PdfiumTextExtractor::new()),
        embedder: Arc::new(HttpEmbedder::new(
            embedding_endpoint,
            config.embedding_model.clone(),
            config.api_key.clone(),
        )),
        generator: Arc::new(HttpGenerator::new(
            generation_endpoint,
            config.generation_model.clone(),
            config.api_key.clone(),
        )),
        external: Arc::new(ConnectionManager::new()),
        schema_cache: Arc::new(SchemaCache::new()),
        config: Arc::new(config),
    });

    let worker = Worker::new(state, default_handlers(), poll_interval);

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
