use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    chunker::split_text,
    chunkstore::ChunkRecord,
    jobs::JOB_EMBED_DOCUMENT,
    models::{Document, DocumentStatus},
    repo::{DocumentPatch, TransitionOutcome},
    state::AppState,
};

use super::{DocumentPayload, JobExecution, JobHandler, MAX_ATTEMPTS};

/// Chunks and embeds the confirmed text: `EMBEDDING → COMPLETED`. Existing
/// chunks are deleted before the new set is written, so re-embedding a
/// document replaces its chunks instead of accumulating duplicates.
pub struct EmbedDocumentJob;

impl EmbedDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for EmbedDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_EMBED_DOCUMENT
    }

    async fn handle(&self, state: Arc<AppState>, job: crate::models::Job) -> JobExecution {
        let payload = match DocumentPayload::from_job(&job) {
            Ok(payload) => payload,
            Err(error) => return JobExecution::Failed { error },
        };

        let document = match state.documents.get(payload.document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => return JobExecution::Success,
            Err(err) => {
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.to_string(),
                }
            }
        };

        if document.status != DocumentStatus::Embedding {
            info!(document_id = %document.id, status = %document.status, "stale embed job; skipping");
            return JobExecution::Success;
        }

        let Some(text) = document.extracted_text.clone() else {
            return fail_embedding(&state, &document, "no text to embed").await;
        };

        let pieces = split_text(&text, state.config.chunk_size, state.config.chunk_overlap);
        if pieces.is_empty() {
            return fail_embedding(&state, &document, "document text produced no chunks").await;
        }

        let vectors = match state.embedder.embed(&pieces).await {
            Ok(vectors) => vectors,
            Err(err) => {
                if job.attempts >= MAX_ATTEMPTS {
                    return fail_embedding(&state, &document, &format!("embedding failed: {err}"))
                        .await;
                }
                warn!(document_id = %document.id, error = %err, "embedding attempt failed");
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.to_string(),
                };
            }
        };

        let records: Vec<ChunkRecord> = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(ordinal, (text, embedding))| {
                ChunkRecord::new(
                    document.id,
                    document.tenant_id,
                    ordinal as i32,
                    text,
                    embedding,
                    &document.title,
                )
            })
            .collect();
        let chunk_count = records.len();

        // Delete-then-insert keyed by document id keeps re-embedding
        // idempotent.
        let store_result = async {
            state.chunks.delete_by_document(document.id).await?;
            state.chunks.upsert(records).await
        }
        .await;
        if let Err(err) = store_result {
            if job.attempts >= MAX_ATTEMPTS {
                return fail_embedding(&state, &document, &format!("chunk write failed: {err}"))
                    .await;
            }
            warn!(document_id = %document.id, error = %err, "chunk write failed");
            return JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err.to_string(),
            };
        }

        match state
            .documents
            .transition(
                document.id,
                &[DocumentStatus::Embedding],
                DocumentStatus::Completed,
                DocumentPatch::default(),
            )
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                info!(document_id = %document.id, chunk_count, "document embedded");
                JobExecution::Success
            }
            Ok(_) => JobExecution::Success,
            Err(err) => JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err.to_string(),
            },
        }
    }
}

async fn fail_embedding(state: &AppState, document: &Document, reason: &str) -> JobExecution {
    let patch = DocumentPatch {
        failed_reason: Some(Some(reason.to_string())),
        ..Default::default()
    };
    if let Err(err) = state
        .documents
        .transition(
            document.id,
            &[DocumentStatus::Embedding],
            DocumentStatus::ProcessingFailed,
            patch,
        )
        .await
    {
        warn!(document_id = %document.id, error = %err, "failed to record embedding failure");
    }
    JobExecution::Failed {
        error: reason.to_string(),
    }
}
