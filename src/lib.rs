pub mod ai;
pub mod chunker;
pub mod chunkstore;
pub mod classify;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod external;
pub mod extract;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod repo;
pub mod resolve;
pub mod schema;
pub mod schemaguard;
pub mod sqlgen;
pub mod state;
pub mod storage;
pub mod workers;

pub use config::AppConfig;
pub use error::{CoreError, CoreResult};
pub use pipeline::IngestionPipeline;
pub use resolve::{Resolution, ResolutionEngine, ResolveRequest};
pub use state::AppState;
