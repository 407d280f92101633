use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::{with_conn, PgPool};
use crate::models::{
    ColumnGrant, DivisionPermission, DivisionPermissionRow, Document, DocumentRow, DocumentStatus,
    NewDivisionPermissionRow, NewDocumentRow,
};
use crate::schema::{division_permissions, documents};

/// Fields a state transition may set alongside the status change.
/// `Some(None)` on a double-optional field writes NULL.
#[derive(Debug, Default, Clone)]
pub struct DocumentPatch {
    pub storage_key: Option<String>,
    pub extracted_text: Option<String>,
    pub spool_path: Option<Option<String>>,
    pub failed_reason: Option<Option<String>>,
}

/// Outcome of a guarded transition. A conflict carries the status that was
/// actually observed so callers can report `InvalidStateTransition`.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(Document),
    NotFound,
    Conflict(DocumentStatus),
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub tenant_id: Uuid,
    pub title: String,
    pub content_type: Option<String>,
    pub spool_path: Option<String>,
}

/// Persistence seam for documents. Production uses Postgres via diesel;
/// tests plug in an in-memory implementation.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn create(&self, document: NewDocument) -> Result<Document>;

    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Document>>;

    async fn list_by_status(
        &self,
        tenant_id: Uuid,
        status: DocumentStatus,
    ) -> Result<Vec<Document>>;

    /// Atomically moves a document from one of `allowed_from` to `to`,
    /// applying `patch` in the same statement. The check and the write are
    /// a single `UPDATE … WHERE status IN (…)`, so a stale caller racing a
    /// concurrent transition loses cleanly.
    async fn transition(
        &self,
        id: Uuid,
        allowed_from: &[DocumentStatus],
        to: DocumentStatus,
        patch: DocumentPatch,
    ) -> Result<TransitionOutcome>;

    /// Returns false when the document did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Persistence seam for division permissions.
#[async_trait]
pub trait PermissionStore: Send + Sync + 'static {
    async fn permission_for_table(
        &self,
        division_id: Uuid,
        table: &str,
    ) -> Result<Option<DivisionPermission>>;

    async fn list_for_division(&self, division_id: Uuid) -> Result<Vec<DivisionPermission>>;

    /// One row per (division, table): a second grant replaces the first.
    async fn upsert(
        &self,
        division_id: Uuid,
        table: &str,
        columns: ColumnGrant,
    ) -> Result<DivisionPermission>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = documents)]
struct TransitionChangeset {
    status: String,
    storage_key: Option<String>,
    extracted_text: Option<String>,
    spool_path: Option<Option<String>>,
    failed_reason: Option<Option<String>>,
    updated_at: chrono::NaiveDateTime,
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create(&self, document: NewDocument) -> Result<Document> {
        with_conn(&self.pool, move |conn| {
            let row = NewDocumentRow {
                id: Uuid::new_v4(),
                tenant_id: document.tenant_id,
                title: document.title,
                content_type: document.content_type,
                status: DocumentStatus::Uploading.as_str().to_string(),
                spool_path: document.spool_path,
            };
            diesel::insert_into(documents::table)
                .values(&row)
                .execute(conn)?;
            let created: DocumentRow = documents::table.find(row.id).first(conn)?;
            created.try_into()
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        with_conn(&self.pool, move |conn| {
            let row: Option<DocumentRow> =
                documents::table.find(id).first(conn).optional()?;
            row.map(Document::try_from).transpose()
        })
        .await
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Document>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<DocumentRow> = documents::table
                .filter(documents::tenant_id.eq(tenant_id))
                .order(documents::created_at.desc())
                .load(conn)?;
            rows.into_iter().map(Document::try_from).collect()
        })
        .await
    }

    async fn list_by_status(
        &self,
        tenant_id: Uuid,
        status: DocumentStatus,
    ) -> Result<Vec<Document>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<DocumentRow> = documents::table
                .filter(documents::tenant_id.eq(tenant_id))
                .filter(documents::status.eq(status.as_str()))
                .order(documents::created_at.desc())
                .load(conn)?;
            rows.into_iter().map(Document::try_from).collect()
        })
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        allowed_from: &[DocumentStatus],
        to: DocumentStatus,
        patch: DocumentPatch,
    ) -> Result<TransitionOutcome> {
        let from: Vec<String> = allowed_from
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        with_conn(&self.pool, move |conn| {
            let changeset = TransitionChangeset {
                status: to.as_str().to_string(),
                storage_key: patch.storage_key,
                extracted_text: patch.extracted_text,
                spool_path: patch.spool_path,
                failed_reason: patch.failed_reason,
                updated_at: Utc::now().naive_utc(),
            };

            let updated = diesel::update(
                documents::table
                    .find(id)
                    .filter(documents::status.eq_any(&from)),
            )
            .set(changeset)
            .execute(conn)?;

            if updated == 0 {
                let current: Option<String> = documents::table
                    .find(id)
                    .select(documents::status)
                    .first(conn)
                    .optional()?;
                return Ok(match current {
                    None => TransitionOutcome::NotFound,
                    Some(status) => TransitionOutcome::Conflict(
                        status.parse().map_err(anyhow::Error::msg)?,
                    ),
                });
            }

            let row: DocumentRow = documents::table.find(id).first(conn)?;
            Ok(TransitionOutcome::Applied(row.try_into()?))
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        with_conn(&self.pool, move |conn| {
            let deleted = diesel::delete(documents::table.find(id)).execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }
}

pub struct PgPermissionStore {
    pool: PgPool,
}

impl PgPermissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermissionStore for PgPermissionStore {
    async fn permission_for_table(
        &self,
        division_id: Uuid,
        table: &str,
    ) -> Result<Option<DivisionPermission>> {
        let table = table.to_string();
        with_conn(&self.pool, move |conn| {
            let row: Option<DivisionPermissionRow> = division_permissions::table
                .filter(division_permissions::division_id.eq(division_id))
                .filter(division_permissions::table_name.eq(&table))
                .first(conn)
                .optional()?;
            row.map(DivisionPermission::try_from).transpose()
        })
        .await
    }

    async fn list_for_division(&self, division_id: Uuid) -> Result<Vec<DivisionPermission>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<DivisionPermissionRow> = division_permissions::table
                .filter(division_permissions::division_id.eq(division_id))
                .order(division_permissions::table_name.asc())
                .load(conn)?;
            rows.into_iter().map(DivisionPermission::try_from).collect()
        })
        .await
    }

    async fn upsert(
        &self,
        division_id: Uuid,
        table: &str,
        columns: ColumnGrant,
    ) -> Result<DivisionPermission> {
        let table = table.to_string();
        with_conn(&self.pool, move |conn| {
            let row = NewDivisionPermissionRow {
                id: Uuid::new_v4(),
                division_id,
                table_name: table,
                allowed_columns: serde_json::to_value(&columns)?,
            };
            diesel::insert_into(division_permissions::table)
                .values(&row)
                .on_conflict((
                    division_permissions::division_id,
                    division_permissions::table_name,
                ))
                .do_update()
                .set(division_permissions::allowed_columns.eq(&row.allowed_columns))
                .execute(conn)?;

            let stored: DivisionPermissionRow = division_permissions::table
                .filter(division_permissions::division_id.eq(division_id))
                .filter(division_permissions::table_name.eq(&row.table_name))
                .first(conn)?;
            stored.try_into()
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        with_conn(&self.pool, move |conn| {
            let deleted =
                diesel::delete(division_permissions::table.find(id)).execute(conn)?;
            Ok(deleted > 0)
        })
        .await
    }
}
