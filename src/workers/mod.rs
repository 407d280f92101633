use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{models::Job, state::AppState};

pub mod embed;
pub mod ocr;
pub mod upload;

/// Attempts after which a retrying stage gives up and parks the document
/// in its failed state.
pub const MAX_ATTEMPTS: i32 = 5;

#[derive(Debug)]
pub enum JobExecution {
    Success,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution;
}

/// Payload shared by every pipeline stage job.
#[derive(Clone, Debug, Deserialize)]
pub struct DocumentPayload {
    pub document_id: Uuid,
}

impl DocumentPayload {
    pub fn from_job(job: &Job) -> Result<Self, String> {
        serde_json::from_value(job.payload.clone())
            .map_err(|err| format!("invalid job payload: {err}"))
    }
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
    ) -> Self {
        let map = handlers
            .into_iter()
            .map(|handler| (handler.job_type(), handler))
            .collect();
        Self {
            state,
            handlers: map,
            poll_interval,
        }
    }

    pub async fn run(&self) {
        info!("worker started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Reserves and runs at most one job. Returns whether a job was found,
    /// so the loop only sleeps when the queue is empty.
    pub async fn tick(&self) -> anyhow::Result<bool> {
        let job_types: Vec<&str> = self.handlers.keys().copied().collect();
        if job_types.is_empty() {
            return Ok(false);
        }

        let Some(job) = self.state.queue.reserve(&job_types).await? else {
            return Ok(false);
        };

        match self.handlers.get(job.job_type.as_str()) {
            Some(handler) => {
                let result = handler.handle(self.state.clone(), job.clone()).await;
                match result {
                    JobExecution::Success => {
                        self.state.queue.mark_succeeded(job.id).await?;
                        info!(job_id = %job.id, job_type = %job.job_type, "job completed");
                    }
                    JobExecution::Retry { delay, error } => {
                        warn!(job_id = %job.id, job_type = %job.job_type, %error, "job will retry");
                        self.state.queue.retry_after(job.id, delay, &error).await?;
                    }
                    JobExecution::Failed { error } => {
                        error!(job_id = %job.id, job_type = %job.job_type, %error, "job failed");
                        self.state.queue.mark_failed(job.id, &error).await?;
                    }
                }
            }
            None => {
                error!(job_type = %job.job_type, "no handler registered for job type");
                self.state
                    .queue
                    .mark_failed(job.id, "no handler registered")
                    .await?;
            }
        }
        Ok(true)
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(upload::UploadDocumentJob::new()),
        Arc::new(ocr::OcrDocumentJob::new()),
        Arc::new(embed::EmbedDocumentJob::new()),
    ]
}
