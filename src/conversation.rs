use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use uuid::Uuid;

use crate::db::{with_conn, PgPool};
use crate::models::{ConversationTurn, ConversationTurnRow, NewConversationTurnRow};
use crate::schema::conversation_turns;

#[derive(Debug, Clone)]
pub struct NewTurn {
    pub conversation_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub question: String,
    pub answer: String,
    pub sources: Vec<String>,
    pub used_database: bool,
}

/// Append-only log of chat turns. Doubles as the audit trail and the
/// context-window source; there is deliberately no update operation.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    async fn append(&self, turn: NewTurn) -> Result<ConversationTurn>;

    /// Most recent `limit` turns for a conversation, oldest first, scoped
    /// to the (tenant, user) pair that owns it.
    async fn recent_turns(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>>;

    /// Full history of one conversation, tenant-scoped (audit view).
    async fn turns_for_conversation(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Vec<ConversationTurn>>;

    /// Distinct conversation ids for a user, most recent activity first.
    async fn conversations_for_user(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Uuid>>;
}

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn append(&self, turn: NewTurn) -> Result<ConversationTurn> {
        with_conn(&self.pool, move |conn| {
            let row = NewConversationTurnRow {
                id: Uuid::new_v4(),
                conversation_id: turn.conversation_id,
                tenant_id: turn.tenant_id,
                user_id: turn.user_id,
                question: turn.question,
                answer: turn.answer,
                sources: serde_json::to_value(&turn.sources)?,
                used_database: turn.used_database,
            };
            diesel::insert_into(conversation_turns::table)
                .values(&row)
                .execute(conn)?;
            let stored: ConversationTurnRow =
                conversation_turns::table.find(row.id).first(conn)?;
            stored.try_into()
        })
        .await
    }

    async fn recent_turns(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<ConversationTurnRow> = conversation_turns::table
                .filter(conversation_turns::conversation_id.eq(conversation_id))
                .filter(conversation_turns::tenant_id.eq(tenant_id))
                .filter(conversation_turns::user_id.eq(user_id))
                .order(conversation_turns::created_at.desc())
                .limit(limit as i64)
                .load(conn)?;
            let mut turns: Vec<ConversationTurn> = rows
                .into_iter()
                .map(ConversationTurn::try_from)
                .collect::<Result<_>>()?;
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    async fn turns_for_conversation(
        &self,
        conversation_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Vec<ConversationTurn>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<ConversationTurnRow> = conversation_turns::table
                .filter(conversation_turns::conversation_id.eq(conversation_id))
                .filter(conversation_turns::tenant_id.eq(tenant_id))
                .order(conversation_turns::created_at.asc())
                .load(conn)?;
            rows.into_iter().map(ConversationTurn::try_from).collect()
        })
        .await
    }

    async fn conversations_for_user(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Uuid>> {
        with_conn(&self.pool, move |conn| {
            let rows: Vec<(Uuid, chrono::NaiveDateTime)> = conversation_turns::table
                .filter(conversation_turns::tenant_id.eq(tenant_id))
                .filter(conversation_turns::user_id.eq(user_id))
                .group_by(conversation_turns::conversation_id)
                .select((
                    conversation_turns::conversation_id,
                    diesel::dsl::max(conversation_turns::created_at).assume_not_null(),
                ))
                .order(diesel::dsl::max(conversation_turns::created_at).desc())
                .load(conn)?;
            Ok(rows.into_iter().map(|(id, _)| id).collect())
        })
        .await
    }
}
