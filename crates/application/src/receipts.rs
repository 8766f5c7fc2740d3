use async_trait::async_trait;
use dashmap::DashMap;
use domain::{ConversationId, DeliveryReceipt, ParticipantId, SequenceNumber, StoreResult};

/// 送达回执存储
///
/// 记录每个参与者在每个会话中确认过的最高序列号，重连时从这里继续重放。
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// 记录确认；较旧的确认不会降低已记录的值
    async fn record(&self, receipt: &DeliveryReceipt) -> StoreResult<()>;

    /// 最后确认的序列号，从未确认过时为 `SequenceNumber::ZERO`
    async fn last_acknowledged(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
    ) -> StoreResult<SequenceNumber>;
}

#[derive(Default)]
pub struct InMemoryReceiptStore {
    acknowledged: DashMap<(ParticipantId, ConversationId), SequenceNumber>,
}

impl InMemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReceiptStore for InMemoryReceiptStore {
    async fn record(&self, receipt: &DeliveryReceipt) -> StoreResult<()> {
        self.acknowledged
            .entry((receipt.participant_id, receipt.conversation_id))
            .and_modify(|current| {
                if receipt.advances(*current) {
                    *current = receipt.sequence;
                }
            })
            .or_insert(receipt.sequence);
        Ok(())
    }

    async fn last_acknowledged(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
    ) -> StoreResult<SequenceNumber> {
        Ok(self
            .acknowledged
            .get(&(participant, conversation))
            .map(|entry| *entry.value())
            .unwrap_or(SequenceNumber::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::SessionId;

    #[tokio::test]
    async fn receipts_never_move_backwards() {
        let store = InMemoryReceiptStore::new();
        let participant = ParticipantId::random();
        let conversation = ConversationId::random();
        let receipt = |seq| {
            DeliveryReceipt::new(
                SessionId::random(),
                participant,
                conversation,
                SequenceNumber::new(seq),
            )
        };

        store.record(&receipt(4)).await.unwrap();
        store.record(&receipt(2)).await.unwrap();
        assert_eq!(
            store.last_acknowledged(participant, conversation).await.unwrap(),
            SequenceNumber::new(4)
        );

        store.record(&receipt(7)).await.unwrap();
        assert_eq!(
            store.last_acknowledged(participant, conversation).await.unwrap(),
            SequenceNumber::new(7)
        );
        assert_eq!(
            store
                .last_acknowledged(ParticipantId::random(), conversation)
                .await
                .unwrap(),
            SequenceNumber::ZERO
        );
    }
}
