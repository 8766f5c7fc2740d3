use std::time::Duration;

use application::ReceiptStore;
use async_trait::async_trait;
use domain::{ConversationId, DeliveryReceipt, ParticipantId, SequenceNumber, StoreResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repository::{sequence_from_db, sequence_to_db, timed};

/// PostgreSQL 回执存储
///
/// 每个 `(participant, conversation)` 一行，`GREATEST` 保证确认值只增不减。
#[derive(Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
    operation_timeout: Duration,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            operation_timeout,
        }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn record(&self, receipt: &DeliveryReceipt) -> StoreResult<()> {
        timed(
            "record receipt",
            self.operation_timeout,
            sqlx::query(
                r#"
                INSERT INTO receipts (participant_id, conversation_id, sequence, session_id, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (participant_id, conversation_id) DO UPDATE
                SET sequence = GREATEST(receipts.sequence, EXCLUDED.sequence),
                    session_id = CASE
                        WHEN EXCLUDED.sequence > receipts.sequence THEN EXCLUDED.session_id
                        ELSE receipts.session_id
                    END,
                    updated_at = NOW()
                "#,
            )
            .bind(Uuid::from(receipt.participant_id))
            .bind(Uuid::from(receipt.conversation_id))
            .bind(sequence_to_db(receipt.sequence)?)
            .bind(Uuid::from(receipt.session_id))
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn last_acknowledged(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
    ) -> StoreResult<SequenceNumber> {
        let sequence: Option<i64> = timed(
            "read receipt",
            self.operation_timeout,
            sqlx::query_scalar(
                r#"
                SELECT sequence FROM receipts
                WHERE participant_id = $1 AND conversation_id = $2
                "#,
            )
            .bind(Uuid::from(participant))
            .bind(Uuid::from(conversation))
            .fetch_optional(&self.pool),
        )
        .await?;

        match sequence {
            Some(value) => sequence_from_db(value),
            None => Ok(SequenceNumber::ZERO),
        }
    }
}
