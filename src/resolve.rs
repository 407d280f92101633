use std::fmt::Write as _;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    chunkstore::ScoredChunk,
    classify::{IntentClassifier, LexicalClassifier},
    conversation::NewTurn,
    error::{CoreError, CoreResult},
    models::ConversationTurn,
    schemaguard::SchemaGuard,
    sqlgen::{build_query_prompt, extract_candidate},
    state::AppState,
};

/// Answer returned when generation fails or times out. Persisted like any
/// other turn so the conversation log stays complete.
const DEGRADED_ANSWER: &str =
    "I was unable to determine an answer to that question right now. \
     Please try again or rephrase it.";

#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub division_id: Uuid,
    pub message: String,
    /// None starts a new conversation.
    pub conversation_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub conversation_id: Uuid,
    pub answer: String,
    pub sources: Vec<String>,
    /// True iff a generated query actually executed against the tenant's
    /// external database for this turn.
    pub used_database: bool,
}

/// Answers one user message from the tenant's two knowledge sources:
/// retrieved document chunks, and optionally a permission-guarded query
/// against the tenant's external database.
///
/// The structured path is best-effort throughout. A missing registration,
/// a generation refusal, a guard rejection, an execution error, or a
/// timeout all abandon it silently; the caller sees a document-only answer
/// and never any schema or query text.
pub struct ResolutionEngine {
    state: Arc<AppState>,
    guard: SchemaGuard,
    classifier: Arc<dyn IntentClassifier>,
}

impl ResolutionEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        let guard = SchemaGuard::new(state.permissions.clone());
        Self {
            state,
            guard,
            classifier: Arc::new(LexicalClassifier::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub async fn resolve(&self, request: ResolveRequest) -> CoreResult<Resolution> {
        let (conversation_id, history) = match request.conversation_id {
            Some(id) => {
                let turns = self
                    .state
                    .conversations
                    .recent_turns(
                        id,
                        request.tenant_id,
                        request.user_id,
                        self.state.config.history_window,
                    )
                    .await?;
                (id, turns)
            }
            None => (Uuid::new_v4(), Vec::new()),
        };

        let chunks = self.retrieve(request.tenant_id, &request.message).await;
        let sources = dedup_sources(&chunks);

        let database_rows = if self.classifier.wants_structured_data(&request.message) {
            self.try_structured(request.tenant_id, request.division_id, &request.message)
                .await
        } else {
            None
        };
        let used_database = database_rows.is_some();

        let prompt = compose_prompt(&request.message, &history, &chunks, database_rows.as_deref());
        let answer = match timeout(
            self.state.config.generation_timeout,
            self.state.generator.generate(&prompt),
        )
        .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(err)) => degrade(CoreError::Generation(err.to_string())),
            Err(_) => degrade(CoreError::Generation("timed out".to_string())),
        };

        self.state
            .conversations
            .append(NewTurn {
                conversation_id,
                tenant_id: request.tenant_id,
                user_id: request.user_id,
                question: request.message,
                answer: answer.clone(),
                sources: sources.clone(),
                used_database,
            })
            .await?;

        info!(
            %conversation_id,
            tenant_id = %request.tenant_id,
            used_database,
            chunk_count = chunks.len(),
            "message resolved"
        );

        Ok(Resolution {
            conversation_id,
            answer,
            sources,
            used_database,
        })
    }

    /// Retrieval never fails the turn: an embedding or index error just
    /// means answering without document context.
    async fn retrieve(&self, tenant_id: Uuid, message: &str) -> Vec<ScoredChunk> {
        let embedding = match self.state.embedder.embed_one(message).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(error = %err, "query embedding failed; skipping retrieval");
                return Vec::new();
            }
        };

        match self
            .state
            .chunks
            .query(tenant_id, &embedding, self.state.config.retrieval_top_k)
            .await
        {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(error = %err, "chunk retrieval failed; skipping");
                Vec::new()
            }
        }
    }

    async fn try_structured(
        &self,
        tenant_id: Uuid,
        division_id: Uuid,
        message: &str,
    ) -> Option<Vec<serde_json::Value>> {
        let database = match self.state.external.database_for(tenant_id).await {
            Ok(Some(database)) => database,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, %tenant_id, "external database lookup failed");
                return None;
            }
        };

        let schema = match self
            .state
            .schema_cache
            .schema_for(tenant_id, database.as_ref())
            .await
        {
            Ok(schema) => schema,
            Err(err) => {
                warn!(error = %err, %tenant_id, "schema introspection failed");
                return None;
            }
        };

        let prompt = build_query_prompt(message, &schema);
        let raw = match timeout(
            self.state.config.structured_query_timeout,
            self.state.generator.generate(&prompt),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                debug!(error = %err, "query generation failed");
                return None;
            }
            Err(_) => {
                debug!("query generation timed out");
                return None;
            }
        };

        let candidate = extract_candidate(&raw)?;

        let validated = match self
            .guard
            .validate_statement(&candidate, division_id, &schema)
            .await
        {
            Ok(validated) => validated,
            Err(err) => {
                debug!(error = %err, %division_id, "candidate query rejected");
                return None;
            }
        };

        match timeout(
            self.state.config.structured_query_timeout,
            database.run_select(&validated),
        )
        .await
        {
            Ok(Ok(rows)) => {
                debug!(%tenant_id, row_count = rows.len(), "structured query executed");
                Some(rows)
            }
            Ok(Err(err)) => {
                debug!(error = %err, "structured query execution failed");
                None
            }
            Err(_) => {
                debug!("structured query timed out");
                None
            }
        }
    }
}

/// A failed or timed-out generation becomes the fixed degraded answer; the
/// typed error is logged, never returned.
fn degrade(error: CoreError) -> String {
    warn!(%error, "degrading answer");
    DEGRADED_ANSWER.to_string()
}

fn dedup_sources(chunks: &[ScoredChunk]) -> Vec<String> {
    let mut sources = Vec::new();
    for chunk in chunks {
        if !chunk.source.is_empty() && !sources.contains(&chunk.source) {
            sources.push(chunk.source.clone());
        }
    }
    sources
}

/// Assembles the final generation prompt: persona, bounded history,
/// document context, database results, question. Sections with nothing to
/// say are omitted entirely.
fn compose_prompt(
    question: &str,
    history: &[ConversationTurn],
    chunks: &[ScoredChunk],
    database_rows: Option<&[serde_json::Value]>,
) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant for company employees. Answer using \
         only the context below. If the context does not contain the \
         answer, say you do not know.\n",
    );

    if !history.is_empty() {
        prompt.push_str("\nConversation so far:\n");
        for turn in history {
            let _ = writeln!(prompt, "User: {}", turn.question);
            let _ = writeln!(prompt, "Assistant: {}", turn.answer);
        }
    }

    if !chunks.is_empty() {
        prompt.push_str("\nCompany documents:\n");
        for chunk in chunks {
            let _ = writeln!(prompt, "[{}] {}", chunk.source, chunk.text);
        }
    }

    if let Some(rows) = database_rows {
        prompt.push_str("\nDatabase results:\n");
        let _ = writeln!(
            prompt,
            "{}",
            serde_json::Value::Array(rows.to_vec())
        );
    }

    let _ = write!(prompt, "\nQuestion: {question}");
    prompt
}
