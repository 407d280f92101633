use std::sync::Arc;

use crate::{
    ai::{Embedder, Generator},
    chunkstore::ChunkStore,
    config::AppConfig,
    conversation::ConversationStore,
    external::{ExternalDbRegistry, SchemaCache},
    extract::TextExtractor,
    jobs::JobQueue,
    repo::{DocumentStore, PermissionStore},
    storage::BlobStore,
};

/// Everything the pipeline, the resolution engine, and the workers share.
/// All collaborators are trait objects so tests can assemble a state out of
/// in-memory fakes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub documents: Arc<dyn DocumentStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub chunks: Arc<dyn ChunkStore>,
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub external: Arc<dyn ExternalDbRegistry>,
    pub schema_cache: Arc<SchemaCache>,
}
