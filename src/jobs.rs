use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{with_conn, PgPool};
use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_UPLOAD_DOCUMENT: &str = "upload-document";
pub const JOB_OCR_DOCUMENT: &str = "ocr-document";
pub const JOB_EMBED_DOCUMENT: &str = "embed-document";

/// Durable queue driving pipeline stage transitions. A stage job is only
/// enqueued after the previous stage committed its status change, which is
/// what keeps per-document stages sequential.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        run_after: Option<NaiveDateTime>,
    ) -> Result<Job>;

    /// Claims the next runnable job of one of the given types, marking it
    /// processing. Returns None when the queue is empty.
    async fn reserve(&self, job_types: &[&str]) -> Result<Option<Job>>;

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    async fn retry_after(&self, job_id: Uuid, delay: Duration, error: &str) -> Result<()>;

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()>;
}

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        run_after: Option<NaiveDateTime>,
    ) -> Result<Job> {
        let job_type = job_type.to_string();
        with_conn(&self.pool, move |conn| {
            let new_job = NewJob {
                id: Uuid::new_v4(),
                job_type,
                payload,
                status: STATUS_QUEUED.to_string(),
                run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
            };

            diesel::insert_into(jobs::table)
                .values(&new_job)
                .execute(conn)?;

            let job = jobs::table.find(new_job.id).first(conn)?;
            Ok(job)
        })
        .await
    }

    async fn reserve(&self, job_types: &[&str]) -> Result<Option<Job>> {
        let job_types: Vec<String> = job_types.iter().map(|ty| ty.to_string()).collect();
        with_conn(&self.pool, move |conn| {
            let now = Utc::now().naive_utc();

            let job = conn.transaction(|conn| {
                let job_opt = jobs::table
                    .filter(jobs::status.eq(STATUS_QUEUED))
                    .filter(jobs::run_after.le(now))
                    .filter(jobs::job_type.eq_any(&job_types))
                    .order(jobs::run_after.asc())
                    .for_update()
                    .skip_locked()
                    .first::<Job>(conn)
                    .optional()?;

                if let Some(job) = job_opt {
                    diesel::update(jobs::table.find(job.id))
                        .set((
                            jobs::status.eq(STATUS_PROCESSING),
                            jobs::attempts.eq(job.attempts + 1),
                            jobs::updated_at.eq(now),
                        ))
                        .execute(conn)?;

                    let refreshed = jobs::table.find(job.id).first(conn)?;
                    Ok::<Option<Job>, diesel::result::Error>(Some(refreshed))
                } else {
                    Ok::<Option<Job>, diesel::result::Error>(None)
                }
            })?;
            Ok(job)
        })
        .await
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        with_conn(&self.pool, move |conn| {
            diesel::update(jobs::table.find(job_id))
                .set((
                    jobs::status.eq(STATUS_SUCCEEDED),
                    jobs::last_error.eq::<Option<String>>(None),
                    jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn retry_after(&self, job_id: Uuid, delay: Duration, error: &str) -> Result<()> {
        let error = error.to_string();
        with_conn(&self.pool, move |conn| {
            let next_run = Utc::now()
                + ChronoDuration::from_std(delay)
                    .unwrap_or_else(|_| ChronoDuration::seconds(30));

            diesel::update(jobs::table.find(job_id))
                .set((
                    jobs::status.eq(STATUS_QUEUED),
                    jobs::run_after.eq(next_run.naive_utc()),
                    jobs::last_error.eq(Some(error)),
                    jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        let error = error.to_string();
        with_conn(&self.pool, move |conn| {
            diesel::update(jobs::table.find(job_id))
                .set((
                    jobs::status.eq(STATUS_FAILED),
                    jobs::last_error.eq(Some(error)),
                    jobs::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
