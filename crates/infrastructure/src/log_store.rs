//! PostgreSQL 消息日志
//!
//! 主键 `(conversation_id, sequence)` 承担条件追加：`ON CONFLICT DO NOTHING`
//! 没有写入任何行即说明该序列号已被占用。

use std::time::Duration;

use application::{AppendOutcome, LogStore};
use async_trait::async_trait;
use domain::{
    ConversationId, Message, ParticipantId, SequenceNumber, StoreError, StoreResult, TraceContext,
};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::repository::{sequence_from_db, sequence_to_db, timed};

#[derive(Debug, FromRow)]
struct MessageRecord {
    conversation_id: Uuid,
    sequence: i64,
    sender_id: Uuid,
    payload: Vec<u8>,
    trace: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRecord> for Message {
    type Error = StoreError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        Ok(Message {
            conversation_id: ConversationId::from(value.conversation_id),
            sequence: sequence_from_db(value.sequence)?,
            sender_id: ParticipantId::from(value.sender_id),
            payload: value.payload,
            created_at: value.created_at,
            trace: value.trace.map(TraceContext::new).unwrap_or_default(),
        })
    }
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[derive(Clone)]
pub struct PgLogStore {
    pool: PgPool,
    operation_timeout: Duration,
}

impl PgLogStore {
    pub fn new(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            operation_timeout,
        }
    }
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn append(&self, message: &Message) -> StoreResult<AppendOutcome> {
        let sequence = sequence_to_db(message.sequence)?;
        let result = timed(
            "append message",
            self.operation_timeout,
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, sequence, sender_id, payload, trace, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (conversation_id, sequence) DO NOTHING
                "#,
            )
            .bind(Uuid::from(message.conversation_id))
            .bind(sequence)
            .bind(Uuid::from(message.sender_id))
            .bind(&message.payload)
            .bind(message.trace.as_str())
            .bind(message.created_at)
            .execute(&self.pool),
        )
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                conversation_id = %message.conversation_id,
                sequence = %message.sequence,
                "序列号已被占用"
            );
            return Ok(AppendOutcome::Occupied);
        }
        Ok(AppendOutcome::Committed)
    }

    async fn read(
        &self,
        conversation: ConversationId,
        from: SequenceNumber,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let records = timed(
            "read messages",
            self.operation_timeout,
            sqlx::query_as::<_, MessageRecord>(
                r#"
                SELECT conversation_id, sequence, sender_id, payload, trace, created_at
                FROM messages
                WHERE conversation_id = $1 AND sequence >= $2
                ORDER BY sequence ASC
                LIMIT $3
                "#,
            )
            .bind(Uuid::from(conversation))
            .bind(sequence_to_db(from)?)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool),
        )
        .await?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn head(&self, conversation: ConversationId) -> StoreResult<SequenceNumber> {
        let head: Option<i64> = timed(
            "read head",
            self.operation_timeout,
            sqlx::query_scalar(
                r#"
                SELECT MAX(sequence) FROM messages WHERE conversation_id = $1
                "#,
            )
            .bind(Uuid::from(conversation))
            .fetch_one(&self.pool),
        )
        .await?;

        match head {
            Some(value) => sequence_from_db(value),
            None => Ok(SequenceNumber::ZERO),
        }
    }

    async fn recent(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let records = timed(
            "read recent messages",
            self.operation_timeout,
            sqlx::query_as::<_, MessageRecord>(
                r#"
                SELECT conversation_id, sequence, sender_id, payload, trace, created_at
                FROM messages
                WHERE conversation_id = $1
                ORDER BY sequence DESC
                LIMIT $2
                "#,
            )
            .bind(Uuid::from(conversation))
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool),
        )
        .await?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn get(
        &self,
        conversation: ConversationId,
        sequence: SequenceNumber,
    ) -> StoreResult<Option<Message>> {
        let record = timed(
            "get message",
            self.operation_timeout,
            sqlx::query_as::<_, MessageRecord>(
                r#"
                SELECT conversation_id, sequence, sender_id, payload, trace, created_at
                FROM messages
                WHERE conversation_id = $1 AND sequence = $2
                "#,
            )
            .bind(Uuid::from(conversation))
            .bind(sequence_to_db(sequence)?)
            .fetch_optional(&self.pool),
        )
        .await?;

        record.map(Message::try_from).transpose()
    }
}
