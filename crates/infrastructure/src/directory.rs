//! PostgreSQL 会话目录

use std::collections::HashMap;
use std::time::Duration;

use application::ConversationDirectory;
use async_trait::async_trait;
use domain::{Conversation, ConversationId, ConversationKind, ParticipantId, StoreResult};
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::repository::{invalid_data, timed};

const KIND_GROUP: &str = "group";
const KIND_DIRECT: &str = "direct";

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    kind: String,
    title: Option<String>,
    description: Option<String>,
    admin: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl ConversationRecord {
    fn into_conversation(self, participants: Vec<Uuid>) -> StoreResult<Conversation> {
        let kind = match self.kind.as_str() {
            KIND_GROUP => ConversationKind::Group {
                title: self
                    .title
                    .ok_or_else(|| invalid_data(format!("group {} has no title", self.id)))?,
                description: self.description,
            },
            KIND_DIRECT => ConversationKind::Direct,
            other => return Err(invalid_data(format!("unknown conversation kind {other}"))),
        };
        Conversation::restore(
            ConversationId::from(self.id),
            kind,
            participants.into_iter().map(ParticipantId::from).collect(),
            self.admin.map(ParticipantId::from),
            self.created_at,
            self.updated_at,
        )
        .map_err(|err| invalid_data(err.to_string()))
    }
}

fn kind_columns(kind: &ConversationKind) -> (&'static str, Option<&str>, Option<&str>) {
    match kind {
        ConversationKind::Group { title, description } => {
            (KIND_GROUP, Some(title.as_str()), description.as_deref())
        }
        ConversationKind::Direct => (KIND_DIRECT, None, None),
    }
}

async fn write_participants(
    conn: &mut PgConnection,
    conversation: &Conversation,
) -> Result<(), sqlx::Error> {
    for (ordinal, participant) in conversation.participants().iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, participant_id, ordinal)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(Uuid::from(*participant))
        .bind(ordinal as i32)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgConversationDirectory {
    pool: PgPool,
    operation_timeout: Duration,
}

impl PgConversationDirectory {
    pub fn new(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            operation_timeout,
        }
    }

    async fn insert(&self, conversation: &Conversation) -> Result<(), sqlx::Error> {
        let (kind, title, description) = kind_columns(&conversation.kind);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations (id, kind, title, description, admin, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(kind)
        .bind(title)
        .bind(description)
        .bind(conversation.admin.map(Uuid::from))
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&mut *tx)
        .await?;

        write_participants(&mut tx, conversation).await?;
        tx.commit().await
    }

    /// 元数据与成员在同一事务里替换，读者不会看到一半的成员列表
    async fn replace(&self, conversation: &Conversation) -> Result<(), sqlx::Error> {
        let (_, title, description) = kind_columns(&conversation.kind);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE conversations
            SET title = $2, description = $3, admin = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(Uuid::from(conversation.id))
        .bind(title)
        .bind(description)
        .bind(conversation.admin.map(Uuid::from))
        .bind(conversation.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM conversation_participants WHERE conversation_id = $1")
            .bind(Uuid::from(conversation.id))
            .execute(&mut *tx)
            .await?;

        write_participants(&mut tx, conversation).await?;
        tx.commit().await
    }

    async fn participants(&self, id: Uuid) -> StoreResult<Vec<Uuid>> {
        timed(
            "load participants",
            self.operation_timeout,
            sqlx::query_scalar(
                r#"
                SELECT participant_id FROM conversation_participants
                WHERE conversation_id = $1
                ORDER BY ordinal ASC
                "#,
            )
            .bind(id)
            .fetch_all(&self.pool),
        )
        .await
    }
}

#[async_trait]
impl ConversationDirectory for PgConversationDirectory {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        timed(
            "create conversation",
            self.operation_timeout,
            self.insert(conversation),
        )
        .await
    }

    async fn find(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        let record = timed(
            "find conversation",
            self.operation_timeout,
            sqlx::query_as::<_, ConversationRecord>(
                r#"
                SELECT id, kind, title, description, admin, created_at, updated_at
                FROM conversations
                WHERE id = $1
                "#,
            )
            .bind(Uuid::from(id))
            .fetch_optional(&self.pool),
        )
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };
        let participants = self.participants(record.id).await?;
        record.into_conversation(participants).map(Some)
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        timed(
            "update conversation",
            self.operation_timeout,
            self.replace(conversation),
        )
        .await
    }

    async fn list(&self, page: usize, size: usize) -> StoreResult<Vec<Conversation>> {
        let offset = i64::try_from(page.saturating_mul(size)).unwrap_or(i64::MAX);
        let limit = i64::try_from(size).unwrap_or(i64::MAX);

        let records = timed(
            "list conversations",
            self.operation_timeout,
            sqlx::query_as::<_, ConversationRecord>(
                r#"
                SELECT id, kind, title, description, admin, created_at, updated_at
                FROM conversations
                ORDER BY created_at ASC, id ASC
                LIMIT $1 OFFSET $2
                "#,
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool),
        )
        .await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
        let rows: Vec<(Uuid, Uuid)> = timed(
            "load participants",
            self.operation_timeout,
            sqlx::query_as(
                r#"
                SELECT conversation_id, participant_id FROM conversation_participants
                WHERE conversation_id = ANY($1)
                ORDER BY conversation_id, ordinal ASC
                "#,
            )
            .bind(&ids)
            .fetch_all(&self.pool),
        )
        .await?;

        let mut members: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (conversation_id, participant_id) in rows {
            members.entry(conversation_id).or_default().push(participant_id);
        }

        records
            .into_iter()
            .map(|record| {
                let participants = members.remove(&record.id).unwrap_or_default();
                record.into_conversation(participants)
            })
            .collect()
    }

    async fn conversations_of(
        &self,
        participant: ParticipantId,
    ) -> StoreResult<Vec<ConversationId>> {
        let ids: Vec<Uuid> = timed(
            "list memberships",
            self.operation_timeout,
            sqlx::query_scalar(
                r#"
                SELECT conversation_id FROM conversation_participants
                WHERE participant_id = $1
                ORDER BY conversation_id
                "#,
            )
            .bind(Uuid::from(participant))
            .fetch_all(&self.pool),
        )
        .await?;

        Ok(ids.into_iter().map(ConversationId::from).collect())
    }
}
