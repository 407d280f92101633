use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use tokio::fs;
use tracing::{info, warn};

use crate::{
    jobs::{JOB_OCR_DOCUMENT, JOB_UPLOAD_DOCUMENT},
    models::{Document, DocumentStatus},
    repo::DocumentPatch,
    state::AppState,
};

use super::{DocumentPayload, JobExecution, JobHandler, MAX_ATTEMPTS};

/// Moves spooled bytes into blob storage: `UPLOADING → UPLOADED`, recording
/// the storage key and dropping the spool copy. Enqueues OCR on success.
pub struct UploadDocumentJob;

impl UploadDocumentJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for UploadDocumentJob {
    fn job_type(&self) -> &'static str {
        JOB_UPLOAD_DOCUMENT
    }

    async fn handle(&self, state: Arc<AppState>, job: crate::models::Job) -> JobExecution {
        let payload = match DocumentPayload::from_job(&job) {
            Ok(payload) => payload,
            Err(error) => return JobExecution::Failed { error },
        };

        let document = match state.documents.get(payload.document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                // Deleted while queued; nothing to do.
                return JobExecution::Success;
            }
            Err(err) => {
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.to_string(),
                }
            }
        };

        match document.status {
            DocumentStatus::Uploading => {}
            DocumentStatus::Uploaded => {
                // A previous run committed the upload but may have died
                // before enqueueing the next stage.
                if let Err(err) = state
                    .queue
                    .enqueue(
                        JOB_OCR_DOCUMENT,
                        json!({ "document_id": document.id }),
                        None,
                    )
                    .await
                {
                    return JobExecution::Retry {
                        delay: Duration::from_secs(30),
                        error: err.to_string(),
                    };
                }
                return JobExecution::Success;
            }
            other => {
                info!(document_id = %document.id, status = %other, "stale upload job; skipping");
                return JobExecution::Success;
            }
        }

        let Some(spool_path) = document.spool_path.clone() else {
            return fail_upload(&state, &document, "no spooled bytes to upload").await;
        };

        let bytes = match fs::read(&spool_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return fail_upload(&state, &document, &format!("spool file unreadable: {err}"))
                    .await;
            }
        };

        let storage_key = format!("documents/{}/{}", document.tenant_id, document.id);
        if let Err(err) = state
            .blobs
            .put(&storage_key, bytes, document.content_type.clone())
            .await
        {
            if job.attempts >= MAX_ATTEMPTS {
                return fail_upload(&state, &document, &format!("upload failed: {err}")).await;
            }
            warn!(document_id = %document.id, error = %err, "upload attempt failed");
            return JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err.to_string(),
            };
        }

        let patch = DocumentPatch {
            storage_key: Some(storage_key),
            spool_path: Some(None),
            ..Default::default()
        };
        match state
            .documents
            .transition(
                document.id,
                &[DocumentStatus::Uploading],
                DocumentStatus::Uploaded,
                patch,
            )
            .await
        {
            Ok(crate::repo::TransitionOutcome::Applied(_)) => {}
            Ok(_) => {
                // Lost the race to a concurrent transition; the winner owns
                // the document now.
                return JobExecution::Success;
            }
            Err(err) => {
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err.to_string(),
                }
            }
        }

        if let Err(err) = fs::remove_file(&spool_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(document_id = %document.id, error = %err, "failed to remove spool file");
            }
        }

        if let Err(err) = state
            .queue
            .enqueue(
                JOB_OCR_DOCUMENT,
                json!({ "document_id": document.id }),
                None,
            )
            .await
        {
            return JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err.to_string(),
            };
        }

        info!(document_id = %document.id, "document uploaded");
        JobExecution::Success
    }
}

/// Parks the document in `UPLOAD_FAILED` with the reason. The spool copy is
/// deliberately left on disk so a retry can re-read it.
async fn fail_upload(state: &AppState, document: &Document, reason: &str) -> JobExecution {
    let patch = DocumentPatch {
        failed_reason: Some(Some(reason.to_string())),
        ..Default::default()
    };
    if let Err(err) = state
        .documents
        .transition(
            document.id,
            &[DocumentStatus::Uploading],
            DocumentStatus::UploadFailed,
            patch,
        )
        .await
    {
        warn!(document_id = %document.id, error = %err, "failed to record upload failure");
    }
    JobExecution::Failed {
        error: reason.to_string(),
    }
}
