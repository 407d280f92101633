#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use serde_json::Value;
use uuid::Uuid;

use ragdesk::ai::{Embedder, Generator};
use ragdesk::chunkstore::{ChunkRecord, ChunkStore, ScoredChunk};
use ragdesk::config::AppConfig;
use ragdesk::conversation::{ConversationStore, NewTurn};
use ragdesk::external::{ExternalDatabase, ExternalDbRegistry, ExternalSchema, SchemaCache};
use ragdesk::extract::TextExtractor;
use ragdesk::jobs::{JobQueue, STATUS_FAILED, STATUS_PROCESSING, STATUS_QUEUED, STATUS_SUCCEEDED};
use ragdesk::models::{
    ColumnGrant, ConversationTurn, DivisionPermission, Document, DocumentStatus, Job,
};
use ragdesk::repo::{
    DocumentPatch, DocumentStore, NewDocument, PermissionStore, TransitionOutcome,
};
use ragdesk::state::AppState;
use ragdesk::storage::BlobStore;
use ragdesk::workers::{default_handlers, Worker};

/// Monotonic timestamps so ordering by `created_at` is deterministic even
/// within one test tick.
static CLOCK: AtomicI64 = AtomicI64::new(0);

pub fn next_timestamp() -> NaiveDateTime {
    let offset = CLOCK.fetch_add(1, Ordering::SeqCst);
    Utc::now().naive_utc() + TimeDelta::microseconds(offset)
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<Uuid, Document>>,
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, document: NewDocument) -> Result<Document> {
        let now = next_timestamp();
        let stored = Document {
            id: Uuid::new_v4(),
            tenant_id: document.tenant_id,
            title: document.title,
            content_type: document.content_type,
            status: DocumentStatus::Uploading,
            storage_key: None,
            spool_path: document.spool_path,
            extracted_text: None,
            failed_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.documents
            .lock()
            .unwrap()
            .insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.lock().unwrap().get(&id).cloned())
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Document>> {
        let mut documents: Vec<Document> = self
            .documents
            .lock()
            .unwrap()
            .values()
            .filter(|document| document.tenant_id == tenant_id)
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(documents)
    }

    async fn list_by_status(
        &self,
        tenant_id: Uuid,
        status: DocumentStatus,
    ) -> Result<Vec<Document>> {
        Ok(self
            .list_for_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|document| document.status == status)
            .collect())
    }

    async fn transition(
        &self,
        id: Uuid,
        allowed_from: &[DocumentStatus],
        to: DocumentStatus,
        patch: DocumentPatch,
    ) -> Result<TransitionOutcome> {
        let mut documents = self.documents.lock().unwrap();
        let Some(document) = documents.get_mut(&id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !allowed_from.contains(&document.status) {
            return Ok(TransitionOutcome::Conflict(document.status));
        }
        document.status = to;
        if let Some(storage_key) = patch.storage_key {
            document.storage_key = Some(storage_key);
        }
        if let Some(extracted_text) = patch.extracted_text {
            document.extracted_text = Some(extracted_text);
        }
        if let Some(spool_path) = patch.spool_path {
            document.spool_path = spool_path;
        }
        if let Some(failed_reason) = patch.failed_reason {
            document.failed_reason = failed_reason;
        }
        document.updated_at = next_timestamp();
        Ok(TransitionOutcome::Applied(document.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.documents.lock().unwrap().remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryPermissionStore {
    rows: Mutex<HashMap<(Uuid, String), DivisionPermission>>,
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn permission_for_table(
        &self,
        division_id: Uuid,
        table: &str,
    ) -> Result<Option<DivisionPermission>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(division_id, table.to_string()))
            .cloned())
    }

    async fn list_for_division(&self, division_id: Uuid) -> Result<Vec<DivisionPermission>> {
        let mut rows: Vec<DivisionPermission> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.division_id == division_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(rows)
    }

    async fn upsert(
        &self,
        division_id: Uuid,
        table: &str,
        columns: ColumnGrant,
    ) -> Result<DivisionPermission> {
        let row = DivisionPermission {
            id: Uuid::new_v4(),
            division_id,
            table_name: table.to_string(),
            columns,
        };
        self.rows
            .lock()
            .unwrap()
            .insert((division_id, table.to_string()), row.clone());
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let key = rows
            .iter()
            .find(|(_, row)| row.id == id)
            .map(|(key, _)| key.clone());
        Ok(match key {
            Some(key) => rows.remove(&key).is_some(),
            None => false,
        })
    }
}

#[derive(Default)]
pub struct MemoryConversationStore {
    turns: Mutex<Vec<ConversationTurn>>,
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(&self, turn: NewTurn) -> Result<ConversationTurn> {
        let stored = ConversationTurn {
            id: Uuid::new_v4(),
            conversation_id: turn.conversation_id,
            tenant_id: turn.tenant_id,
            user_id: turn.user_id,
            question: turn.question,
            answer: turn.answer,
            sources: turn.sources,
            used_database: turn.used_database,
            created_at: next_timestamp(),
        };
        self.turns.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn recent_turns(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let mut turns: Vec<ConversationTurn> = self
            .turns
            .lock()
            .unwrap()
            .iter()
            .filter(|turn| {
                turn.conversation_id == conversation_id
                    && turn.tenant_id == tenant_id
                    && turn.user_id == user_id
            })
            .cloned()
            .collect();
        turns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        turns.truncate(limit);
        turns.reverse();
        Ok(turns)
    }

    async fn turns_for_conversation(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Vec<ConversationTurn>> {
        let mut turns: Vec<ConversationTurn> = self
            .turns
            .lock()
            .unwrap()
            .iter()
            .filter(|turn| turn.conversation_id == conversation_id && turn.tenant_id == tenant_id)
            .cloned()
            .collect();
        turns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(turns)
    }

    async fn conversations_for_user(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<Uuid>> {
        let turns = self.turns.lock().unwrap();
        let mut latest: HashMap<Uuid, NaiveDateTime> = HashMap::new();
        for turn in turns
            .iter()
            .filter(|turn| turn.tenant_id == tenant_id && turn.user_id == user_id)
        {
            let entry = latest.entry(turn.conversation_id).or_insert(turn.created_at);
            if turn.created_at > *entry {
                *entry = turn.created_at;
            }
        }
        let mut ids: Vec<(Uuid, NaiveDateTime)> = latest.into_iter().collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(ids.into_iter().map(|(id, _)| id).collect())
    }
}

#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<Vec<ChunkRecord>>,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn upsert(&self, records: Vec<ChunkRecord>) -> Result<()> {
        self.chunks.lock().unwrap().extend(records);
        Ok(())
    }

    async fn query(
        &self,
        tenant_id: Uuid,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.chunks.lock().unwrap();
        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .filter(|chunk| chunk.tenant_id == tenant_id)
            .map(|chunk| ScoredChunk {
                document_id: chunk.document_id,
                source: chunk
                    .metadata
                    .get("source")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string(),
                text: chunk.text.clone(),
                score: cosine_similarity(embedding, &chunk.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<()> {
        self.chunks
            .lock()
            .unwrap()
            .retain(|chunk| chunk.document_id != document_id);
        Ok(())
    }

    async fn count_for_document(&self, document_id: Uuid) -> Result<usize> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .count())
    }
}

#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        run_after: Option<NaiveDateTime>,
    ) -> Result<Job> {
        let now = next_timestamp();
        let job = Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            status: STATUS_QUEUED.to_string(),
            attempts: 0,
            run_after: run_after.unwrap_or(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn reserve(&self, job_types: &[&str]) -> Result<Option<Job>> {
        // Look a couple of minutes ahead so retry backoffs do not stall
        // drain_jobs in tests.
        let now = Utc::now().naive_utc() + TimeDelta::seconds(120);
        let mut jobs = self.jobs.lock().unwrap();
        let candidate = jobs
            .iter_mut()
            .filter(|job| job.status == STATUS_QUEUED && job.run_after <= now)
            .filter(|job| job_types.contains(&job.job_type.as_str()))
            .min_by_key(|job| job.run_after);
        Ok(candidate.map(|job| {
            job.status = STATUS_PROCESSING.to_string();
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        self.update(job_id, |job| {
            job.status = STATUS_SUCCEEDED.to_string();
            job.last_error = None;
        })
    }

    async fn retry_after(&self, job_id: Uuid, delay: Duration, error: &str) -> Result<()> {
        let next_run = Utc::now().naive_utc()
            + TimeDelta::from_std(delay).unwrap_or_else(|_| TimeDelta::seconds(30));
        self.update(job_id, |job| {
            job.status = STATUS_QUEUED.to_string();
            job.run_after = next_run;
            job.last_error = Some(error.to_string());
        })
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.update(job_id, |job| {
            job.status = STATUS_FAILED.to_string();
            job.last_error = Some(error.to_string());
        })
    }
}

impl MemoryJobQueue {
    fn update(&self, job_id: Uuid, apply: impl FnOnce(&mut Job)) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        apply(job);
        job.updated_at = next_timestamp();
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: Mutex<bool>,
}

impl FakeBlobStore {
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// While set, every `put` fails, simulating an unreachable blob store.
    pub fn set_fail_puts(&self, fail: bool) {
        *self.fail_puts.lock().unwrap() = fail;
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: Option<String>) -> Result<()> {
        if *self.fail_puts.lock().unwrap() {
            return Err(anyhow!("blob store unavailable"));
        }
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such object: {key}"))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Deterministic embedding: byte histogram folded into a small vector.
/// Similar texts land near each other, which is all retrieval tests need.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 8];
    for (index, byte) in text.bytes().enumerate() {
        vector[index % 8] += byte as f32;
    }
    vector
}

#[derive(Default)]
pub struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| embed_text(text)).collect())
    }
}

/// Scripted generator: pops canned responses in order, falling back to a
/// fixed answer when the script runs out. `fail_next` makes the next call
/// error, for degraded-answer tests.
#[derive(Default)]
pub struct FakeGenerator {
    responses: Mutex<Vec<String>>,
    fail_next: Mutex<bool>,
    prompts: Mutex<Vec<String>>,
}

impl FakeGenerator {
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push(response.into());
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
            return Err(anyhow!("generator unavailable"));
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("fake answer".to_string())
        } else {
            Ok(responses.remove(0))
        }
    }
}

/// Extractor that treats every blob as UTF-8 text.
#[derive(Default)]
pub struct FakeExtractor;

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract(&self, bytes: &[u8], _content_type: Option<&str>) -> Result<String> {
        let text = String::from_utf8(bytes.to_vec())?;
        if text.trim().is_empty() {
            return Err(anyhow!("no extractable text found in document"));
        }
        Ok(text)
    }
}

/// External database with a fixed schema and canned result rows; records
/// every executed statement for assertions.
pub struct FakeExternalDatabase {
    schema: ExternalSchema,
    rows: Vec<Value>,
    executed: Mutex<Vec<String>>,
}

impl FakeExternalDatabase {
    pub fn new(schema: ExternalSchema, rows: Vec<Value>) -> Self {
        Self {
            schema,
            rows,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalDatabase for FakeExternalDatabase {
    async fn schema(&self) -> Result<ExternalSchema> {
        Ok(self.schema.clone())
    }

    async fn run_select(&self, sql: &str) -> Result<Vec<Value>> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(self.rows.clone())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    databases: Mutex<HashMap<Uuid, Arc<dyn ExternalDatabase>>>,
}

impl FakeRegistry {
    pub fn register(&self, tenant_id: Uuid, database: Arc<dyn ExternalDatabase>) {
        self.databases.lock().unwrap().insert(tenant_id, database);
    }
}

#[async_trait]
impl ExternalDbRegistry for FakeRegistry {
    async fn database_for(&self, tenant_id: Uuid) -> Result<Option<Arc<dyn ExternalDatabase>>> {
        Ok(self.databases.lock().unwrap().get(&tenant_id).cloned())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://unused".to_string(),
        database_max_pool_size: 1,
        aws_endpoint_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "us-east-1".to_string(),
        s3_bucket: "unused".to_string(),
        embedding_endpoint: None,
        embedding_model: "fake".to_string(),
        generation_endpoint: None,
        generation_model: "fake".to_string(),
        api_key: None,
        spool_dir: spool_dir(),
        chunk_size: 64,
        chunk_overlap: 16,
        retrieval_top_k: 5,
        history_window: 10,
        structured_query_timeout: Duration::from_secs(5),
        generation_timeout: Duration::from_secs(5),
        worker_poll_interval: Duration::from_millis(10),
    }
}

fn spool_dir() -> PathBuf {
    std::env::temp_dir().join(format!("ragdesk-test-{}", Uuid::new_v4()))
}

/// Everything a test needs: the shared state plus typed handles to the
/// fakes for assertions.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub documents: Arc<MemoryDocumentStore>,
    pub permissions: Arc<MemoryPermissionStore>,
    pub conversations: Arc<MemoryConversationStore>,
    pub chunks: Arc<MemoryChunkStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub blobs: Arc<FakeBlobStore>,
    pub generator: Arc<FakeGenerator>,
    pub registry: Arc<FakeRegistry>,
}

impl TestApp {
    pub fn new() -> Self {
        let documents = Arc::new(MemoryDocumentStore::default());
        let permissions = Arc::new(MemoryPermissionStore::default());
        let conversations = Arc::new(MemoryConversationStore::default());
        let chunks = Arc::new(MemoryChunkStore::default());
        let queue = Arc::new(MemoryJobQueue::default());
        let blobs = Arc::new(FakeBlobStore::default());
        let generator = Arc::new(FakeGenerator::default());
        let registry = Arc::new(FakeRegistry::default());

        let state = Arc::new(AppState {
            config: Arc::new(test_config()),
            documents: documents.clone(),
            permissions: permissions.clone(),
            conversations: conversations.clone(),
            chunks: chunks.clone(),
            queue: queue.clone(),
            blobs: blobs.clone(),
            extractor: Arc::new(FakeExtractor),
            embedder: Arc::new(FakeEmbedder),
            generator: generator.clone(),
            external: registry.clone(),
            schema_cache: Arc::new(SchemaCache::new()),
        });

        Self {
            state,
            documents,
            permissions,
            conversations,
            chunks,
            queue,
            blobs,
            generator,
            registry,
        }
    }

    /// Runs queued jobs to completion, exactly like the worker loop would,
    /// minus the idle sleeps.
    pub async fn drain_jobs(&self) {
        let worker = Worker::new(
            self.state.clone(),
            default_handlers(),
            self.state.config.worker_poll_interval,
        );
        for _ in 0..64 {
            match worker.tick().await {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => panic!("worker tick failed: {err}"),
            }
        }
        panic!("job queue did not drain");
    }
}
