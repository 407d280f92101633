use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::*;

/// Pipeline status persisted on a document. Stored as text in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Uploading,
    Uploaded,
    OcrProcessing,
    PendingValidation,
    Embedding,
    Completed,
    UploadFailed,
    ProcessingFailed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "UPLOADING",
            DocumentStatus::Uploaded => "UPLOADED",
            DocumentStatus::OcrProcessing => "OCR_PROCESSING",
            DocumentStatus::PendingValidation => "PENDING_VALIDATION",
            DocumentStatus::Embedding => "EMBEDDING",
            DocumentStatus::Completed => "COMPLETED",
            DocumentStatus::UploadFailed => "UPLOAD_FAILED",
            DocumentStatus::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed
                | DocumentStatus::UploadFailed
                | DocumentStatus::ProcessingFailed
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            DocumentStatus::UploadFailed | DocumentStatus::ProcessingFailed
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UPLOADING" => Ok(DocumentStatus::Uploading),
            "UPLOADED" => Ok(DocumentStatus::Uploaded),
            "OCR_PROCESSING" => Ok(DocumentStatus::OcrProcessing),
            "PENDING_VALIDATION" => Ok(DocumentStatus::PendingValidation),
            "EMBEDDING" => Ok(DocumentStatus::Embedding),
            "COMPLETED" => Ok(DocumentStatus::Completed),
            "UPLOAD_FAILED" => Ok(DocumentStatus::UploadFailed),
            "PROCESSING_FAILED" => Ok(DocumentStatus::ProcessingFailed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = documents)]
pub struct DocumentRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub content_type: Option<String>,
    pub status: String,
    pub storage_key: Option<String>,
    pub spool_path: Option<String>,
    pub extracted_text: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocumentRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub content_type: Option<String>,
    pub status: String,
    pub spool_path: Option<String>,
}

/// Domain view of a document, with the status parsed.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub content_type: Option<String>,
    pub status: DocumentStatus,
    pub storage_key: Option<String>,
    pub spool_path: Option<String>,
    pub extracted_text: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<DocumentRow> for Document {
    type Error = anyhow::Error;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<DocumentStatus>()
            .map_err(anyhow::Error::msg)?;
        Ok(Document {
            id: row.id,
            tenant_id: row.tenant_id,
            title: row.title,
            content_type: row.content_type,
            status,
            storage_key: row.storage_key,
            spool_path: row.spool_path,
            extracted_text: row.extracted_text,
            failed_reason: row.failed_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = chunks)]
pub struct ChunkRow {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub ordinal: i32,
    pub text: String,
    pub embedding: Vector,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = chunks)]
pub struct NewChunkRow {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub ordinal: i32,
    pub text: String,
    pub embedding: Vector,
    pub metadata: serde_json::Value,
}

/// Column grant attached to a division permission: either every column of
/// the table, or an explicit set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnGrant {
    Wildcard(String),
    Only(BTreeSet<String>),
}

impl ColumnGrant {
    pub fn all() -> Self {
        ColumnGrant::Wildcard("*".to_string())
    }

    pub fn only<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ColumnGrant::Only(columns.into_iter().map(Into::into).collect())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, ColumnGrant::Wildcard(marker) if marker == "*")
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = division_permissions)]
pub struct DivisionPermissionRow {
    pub id: Uuid,
    pub division_id: Uuid,
    pub table_name: String,
    pub allowed_columns: serde_json::Value,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = division_permissions)]
pub struct NewDivisionPermissionRow {
    pub id: Uuid,
    pub division_id: Uuid,
    pub table_name: String,
    pub allowed_columns: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivisionPermission {
    pub id: Uuid,
    pub division_id: Uuid,
    pub table_name: String,
    pub columns: ColumnGrant,
}

impl TryFrom<DivisionPermissionRow> for DivisionPermission {
    type Error = anyhow::Error;

    fn try_from(row: DivisionPermissionRow) -> Result<Self, Self::Error> {
        let columns: ColumnGrant = serde_json::from_value(row.allowed_columns)?;
        Ok(DivisionPermission {
            id: row.id,
            division_id: row.division_id,
            table_name: row.table_name,
            columns,
        })
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = conversation_turns)]
pub struct ConversationTurnRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub question: String,
    pub answer: String,
    pub sources: serde_json::Value,
    pub used_database: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = conversation_turns)]
pub struct NewConversationTurnRow {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub question: String,
    pub answer: String,
    pub sources: serde_json::Value,
    pub used_database: bool,
}

/// A single question/answer exchange. Append-only: there is no API anywhere
/// in the crate that mutates a persisted turn.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub question: String,
    pub answer: String,
    pub sources: Vec<String>,
    pub used_database: bool,
    pub created_at: NaiveDateTime,
}

impl TryFrom<ConversationTurnRow> for ConversationTurn {
    type Error = anyhow::Error;

    fn try_from(row: ConversationTurnRow) -> Result<Self, Self::Error> {
        let sources: Vec<String> = serde_json::from_value(row.sources)?;
        Ok(ConversationTurn {
            id: row.id,
            conversation_id: row.conversation_id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            question: row.question,
            answer: row.answer,
            sources,
            used_database: row.used_database,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}
