use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    error::CoreError,
    jobs::JOB_OCR_DOCUMENT,
    models::{Document, DocumentStatus},
    repo::{DocumentPatch, TransitionOutcome},
    state::AppState,
};

use super::{DocumentPayload, JobExecution, JobHandler, MAX_ATTEMPTS};

/// Extracts text from the stored blob: `UPLOADED → OCR_PROCESSING →
/// PENDING_VALIDATION`. Embedding is deliberately not scheduled here; a
/// human has to confirm the text first.
pub struct OcrDocumentJob;

impl OcrDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for OcrDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_OCR_DOCUMENT
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

        // Re-entrant from OCR_PROCESSING so a crashed run can be resumed by
        // its retried job.
        let document = match state
            .documents
            .transition(
                document.id,
                &[DocumentStatus::Uploaded, DocumentStatus::OcrProcessing],
                DocumentStatus::OcrProcessing,
                DocumentPatch::default(),
            )
            .await
        {
            Ok(TransitionOutcome::Applied(document)) => document,
            Ok(_) => {
                info!(document_id = %document.id, "stale OCR job; skipping");
                return JobExecution::Success;
            }
            Err(err) => {
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.to_string(),
                }
            }
        };

        let Some(storage_key) = document.storage_key.clone() else {
            return fail_processing(&state, &document, "no stored blob to extract from").await;
        };

        let bytes = match state.blobs.get(&storage_key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if job.attempts >= MAX_ATTEMPTS {
                    return fail_processing(
                        &state,
                        &document,
                        &format!("failed to fetch blob: {err}"),
                    )
                    .await;
                }
                warn!(document_id = %document.id, error = %err, "blob fetch failed");
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.to_string(),
                };
            }
        };

        let text = match state
            .extractor
            .extract(&bytes, document.content_type.as_deref())
            .await
        {
            Ok(text) => text,
            Err(err) => {
                // Extraction failures are deterministic for a given blob;
                // retrying would reproduce them.
                let reason = CoreError::Extraction(err.to_string()).to_string();
                return fail_processing(&state, &document, &reason).await;
            }
        };

        match state
            .documents
            .transition(
                document.id,
                &[DocumentStatus::OcrProcessing],
                DocumentStatus::PendingValidation,
                DocumentPatch {
                    extracted_text: Some(text),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                info!(document_id = %document.id, "document awaiting validation");
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

async fn fail_processing(state: &AppState, document: &Document, reason: &str) -> JobExecution {
    let patch = DocumentPatch {
        failed_reason: Some(Some(reason.to_string())),
        ..Default::default()
    };
    if let Err(err) = state
        .documents
        .transition(
            document.id,
            &[DocumentStatus::OcrProcessing],
            DocumentStatus::ProcessingFailed,
            patch,
        )
        .await
    {
        warn!(document_id = %document.id, error = %err, "failed to record processing failure");
    }
    JobExecution::Failed {
        error: reason.to_string(),
    }
}
