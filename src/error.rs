use thiserror::Error;
use uuid::Uuid;

pub type CoreResult<T> = Result<T, CoreError>;

/// Error taxonomy exposed by the pipeline and resolution APIs.
///
/// Collaborator failures (storage, extraction, generation, external
/// databases) are absorbed before they reach a caller: the pipeline records
/// them on the document as a failed state and the resolution engine degrades
/// the answer. `Extraction` and `Generation` name those failures where they
/// are recorded and logged; the remaining variants cross the crate boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("document {document_id} is in state {current}, operation requires {required}")]
    InvalidStateTransition {
        document_id: Uuid,
        current: String,
        required: String,
    },

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("division lacks permission for the requested data")]
    PermissionDenied,

    #[error("generated query rejected: {reason}")]
    UnsafeQuery { reason: String },

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(entity: &'static str) -> Self {
        CoreError::NotFound { entity }
    }

    pub fn unsafe_query(reason: impl Into<String>) -> Self {
        CoreError::UnsafeQuery {
            reason: reason.into(),
        }
    }
}

impl From<diesel::result::Error> for CoreError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => CoreError::not_found("record"),
            other => CoreError::Internal(other.into()),
        }
    }
}
