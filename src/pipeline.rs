use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{CoreError, CoreResult},
    jobs::{JOB_EMBED_DOCUMENT, JOB_OCR_DOCUMENT, JOB_UPLOAD_DOCUMENT},
    models::{Document, DocumentStatus},
    repo::{DocumentPatch, NewDocument, TransitionOutcome},
    state::AppState,
};

/// Public API for the document ingestion state machine.
///
/// Every mutation is an atomic compare-and-set on the current status, so a
/// stale caller racing a worker loses with `InvalidStateTransition` instead
/// of clobbering the document. Stage work itself happens in the background
/// workers; this type only moves documents between states and enqueues the
/// next job after each commit.
pub struct IngestionPipeline {
    state: Arc<AppState>,
}

impl IngestionPipeline {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Accepts raw bytes for ingestion: spools them to the local disk,
    /// creates the document in `UPLOADING`, and enqueues the upload job.
    /// The spool copy survives an upload failure so `retry` can re-read it.
    pub async fn submit(
        &self,
        tenant_id: Uuid,
        title: String,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> CoreResult<Document> {
        fs::create_dir_all(&self.state.config.spool_dir)
            .await
            .context("failed to create spool directory")?;

        let spool_path = self
            .state
            .config
            .spool_dir
            .join(format!("{}.bin", Uuid::new_v4()));
        fs::write(&spool_path, &bytes)
            .await
            .context("failed to spool uploaded bytes")?;

        let document = self
            .state
            .documents
            .create(NewDocument {
                tenant_id,
                title,
                content_type,
                spool_path: Some(spool_path.to_string_lossy().into_owned()),
            })
            .await?;

        self.state
            .queue
            .enqueue(
                JOB_UPLOAD_DOCUMENT,
                json!({ "document_id": document.id }),
                None,
            )
            .await?;

        info!(document_id = %document.id, %tenant_id, "document submitted");
        Ok(document)
    }

    /// Applies human-validated text and hands the document to the embedding
    /// stage. Valid only from `PENDING_VALIDATION`.
    pub async fn confirm(&self, document_id: Uuid, confirmed_text: String) -> CoreResult<Document> {
        let document = self
            .require_transition(
                document_id,
                &[DocumentStatus::PendingValidation],
                DocumentStatus::Embedding,
                DocumentPatch {
                    extracted_text: Some(confirmed_text),
                    ..Default::default()
                },
            )
            .await?;

        self.enqueue_stage(JOB_EMBED_DOCUMENT, document_id).await?;
        info!(%document_id, "document confirmed for embedding");
        Ok(document)
    }

    /// Re-drives a failed document from the last recoverable point.
    ///
    /// `UPLOAD_FAILED` resumes at OCR when the bytes already reached blob
    /// storage, otherwise re-attempts the upload from the spool copy; with
    /// neither available the failure is unrecoverable. `PROCESSING_FAILED`
    /// re-enters embedding when validated text survived, otherwise goes
    /// back through OCR.
    pub async fn retry(&self, document_id: Uuid) -> CoreResult<Document> {
        let document = self
            .state
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| CoreError::not_found("document"))?;

        let clear_failure = DocumentPatch {
            failed_reason: Some(None),
            ..Default::default()
        };

        match document.status {
            DocumentStatus::UploadFailed => {
                if document.storage_key.is_some() {
                    let document = self
                        .require_transition(
                            document_id,
                            &[DocumentStatus::UploadFailed],
                            DocumentStatus::Uploaded,
                            clear_failure,
                        )
                        .await?;
                    self.enqueue_stage(JOB_OCR_DOCUMENT, document_id).await?;
                    info!(%document_id, "retrying from OCR stage");
                    Ok(document)
                } else if self.spool_file_exists(&document).await {
                    let document = self
                        .require_transition(
                            document_id,
                            &[DocumentStatus::UploadFailed],
                            DocumentStatus::Uploading,
                            clear_failure,
                        )
                        .await?;
                    self.enqueue_stage(JOB_UPLOAD_DOCUMENT, document_id).await?;
                    info!(%document_id, "retrying upload from spool");
                    Ok(document)
                } else {
                    Err(CoreError::InvalidStateTransition {
                        document_id,
                        current: document.status.to_string(),
                        required: "a failed state with recoverable bytes".to_string(),
                    })
                }
            }
            DocumentStatus::ProcessingFailed => {
                let (to, job_type) = if document.extracted_text.is_some() {
                    (DocumentStatus::Embedding, JOB_EMBED_DOCUMENT)
                } else {
                    (DocumentStatus::Uploaded, JOB_OCR_DOCUMENT)
                };
                let document = self
                    .require_transition(
                        document_id,
                        &[DocumentStatus::ProcessingFailed],
                        to,
                        clear_failure,
                    )
                    .await?;
                self.enqueue_stage(job_type, document_id).await?;
                info!(%document_id, stage = %to, "retrying processing");
                Ok(document)
            }
            other => Err(CoreError::InvalidStateTransition {
                document_id,
                current: other.to_string(),
                required: "UPLOAD_FAILED or PROCESSING_FAILED".to_string(),
            }),
        }
    }

    /// Replaces the text of a completed document and re-embeds it without
    /// going back through upload or OCR.
    pub async fn update_content(&self, document_id: Uuid, new_text: String) -> CoreResult<Document> {
        let document = self
            .require_transition(
                document_id,
                &[DocumentStatus::Completed],
                DocumentStatus::Embedding,
                DocumentPatch {
                    extracted_text: Some(new_text),
                    ..Default::default()
                },
            )
            .await?;

        self.enqueue_stage(JOB_EMBED_DOCUMENT, document_id).await?;
        info!(%document_id, "document content updated, re-embedding");
        Ok(document)
    }

    /// Removes the document and everything derived from it: chunks, the
    /// stored blob, the spool copy, and the row. Valid from any state and
    /// idempotent; deleting an unknown id is an Ok no-op.
    pub async fn delete(&self, document_id: Uuid) -> CoreResult<()> {
        let document = match self.state.documents.get(document_id).await? {
            Some(document) => document,
            None => return Ok(()),
        };

        self.state.chunks.delete_by_document(document_id).await?;

        if let Some(key) = &document.storage_key {
            self.state.blobs.delete(key).await?;
        }

        if let Some(path) = &document.spool_path {
            match fs::remove_file(PathBuf::from(path)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(CoreError::Internal(
                        anyhow::Error::new(err).context("failed to remove spool file"),
                    ))
                }
            }
        }

        self.state.documents.delete(document_id).await?;
        info!(%document_id, "document deleted");
        Ok(())
    }

    pub async fn get(&self, document_id: Uuid, tenant_id: Uuid) -> CoreResult<Document> {
        let document = self
            .state
            .documents
            .get(document_id)
            .await?
            .filter(|document| document.tenant_id == tenant_id)
            .ok_or_else(|| CoreError::not_found("document"))?;
        Ok(document)
    }

    pub async fn list(&self, tenant_id: Uuid) -> CoreResult<Vec<Document>> {
        Ok(self.state.documents.list_for_tenant(tenant_id).await?)
    }

    /// Documents waiting on human validation, the review queue.
    pub async fn list_pending_validation(&self, tenant_id: Uuid) -> CoreResult<Vec<Document>> {
        Ok(self
            .state
            .documents
            .list_by_status(tenant_id, DocumentStatus::PendingValidation)
            .await?)
    }

    async fn require_transition(
        &self,
        document_id: Uuid,
        allowed_from: &[DocumentStatus],
        to: DocumentStatus,
        patch: DocumentPatch,
    ) -> CoreResult<Document> {
        match self
            .state
            .documents
            .transition(document_id, allowed_from, to, patch)
            .await?
        {
            TransitionOutcome::Applied(document) => Ok(document),
            TransitionOutcome::NotFound => Err(CoreError::not_found("document")),
            TransitionOutcome::Conflict(current) => Err(CoreError::InvalidStateTransition {
                document_id,
                current: current.to_string(),
                required: allowed_from
                    .iter()
                    .map(DocumentStatus::as_str)
                    .collect::<Vec<_>>()
                    .join(" or "),
            }),
        }
    }

    async fn enqueue_stage(&self, job_type: &str, document_id: Uuid) -> CoreResult<()> {
        self.state
            .queue
            .enqueue(job_type, json!({ "document_id": document_id }), None)
            .await?;
        Ok(())
    }

    async fn spool_file_exists(&self, document: &Document) -> bool {
        match &document.spool_path {
            Some(path) => fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }
}
