//! 持久化消息日志
//!
//! 日志是每个会话消息的唯一事实来源：按 `(conversation_id, sequence)` 分区存储，
//! 同一序列号只能写入一次。广播总线只是低延迟提示，丢失的消息总能从这里补齐。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use domain::{ConversationId, Message, SequenceNumber, StoreResult};
use tokio::sync::RwLock;

/// 条件追加的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 写入成功
    Committed,
    /// 该序列号已被占用，未写入
    Occupied,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// 条件追加：序列号已存在时返回 `Occupied`，不覆盖原有消息
    async fn append(&self, message: &Message) -> StoreResult<AppendOutcome>;

    /// 从 `from`（含）开始按序列号升序读取最多 `limit` 条
    async fn read(
        &self,
        conversation: ConversationId,
        from: SequenceNumber,
        limit: usize,
    ) -> StoreResult<Vec<Message>>;

    /// 当前最大序列号，没有消息时为 `SequenceNumber::ZERO`
    async fn head(&self, conversation: ConversationId) -> StoreResult<SequenceNumber>;

    /// 最近的 `limit` 条消息，最新的在前
    async fn recent(&self, conversation: ConversationId, limit: usize)
        -> StoreResult<Vec<Message>>;

    async fn get(
        &self,
        conversation: ConversationId,
        sequence: SequenceNumber,
    ) -> StoreResult<Option<Message>>;
}

/// 内存消息日志，用于开发环境和测试
#[derive(Default)]
pub struct InMemoryLogStore {
    partitions: RwLock<HashMap<ConversationId, BTreeMap<SequenceNumber, Message>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 会话内全部消息（测试辅助）
    pub async fn snapshot(&self, conversation: ConversationId) -> Vec<Message> {
        let partitions = self.partitions.read().await;
        partitions
            .get(&conversation)
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn append(&self, message: &Message) -> StoreResult<AppendOutcome> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(message.conversation_id).or_default();
        if partition.contains_key(&message.sequence) {
            return Ok(AppendOutcome::Occupied);
        }
        partition.insert(message.sequence, message.clone());
        Ok(AppendOutcome::Committed)
    }

    async fn read(
        &self,
        conversation: ConversationId,
        from: SequenceNumber,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&conversation)
            .map(|partition| {
                partition
                    .range(from..)
                    .take(limit)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head(&self, conversation: ConversationId) -> StoreResult<SequenceNumber> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&conversation)
            .and_then(|partition| partition.keys().next_back().copied())
            .unwrap_or(SequenceNumber::ZERO))
    }

    async fn recent(
        &self,
        conversation: ConversationId,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&conversation)
            .map(|partition| partition.values().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(
        &self,
        conversation: ConversationId,
        sequence: SequenceNumber,
    ) -> StoreResult<Option<Message>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(&conversation)
            .and_then(|partition| partition.get(&sequence).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{MessageDraft, ParticipantId, TraceContext};
    use time::OffsetDateTime;

    fn message(conversation: ConversationId, sequence: u64) -> Message {
        MessageDraft::new(
            conversation,
            ParticipantId::random(),
            format!("msg-{sequence}").into_bytes(),
            OffsetDateTime::now_utc(),
            TraceContext::empty(),
        )
        .unwrap()
        .sequenced(SequenceNumber::new(sequence))
    }

    #[tokio::test]
    async fn append_rejects_occupied_sequence() {
        let store = InMemoryLogStore::new();
        let conversation = ConversationId::random();

        let first = message(conversation, 1);
        assert_eq!(store.append(&first).await.unwrap(), AppendOutcome::Committed);

        let rival = message(conversation, 1);
        assert_eq!(store.append(&rival).await.unwrap(), AppendOutcome::Occupied);

        // 原消息没有被覆盖
        let stored = store.get(conversation, SequenceNumber::new(1)).await.unwrap();
        assert_eq!(stored, Some(first));
    }

    #[tokio::test]
    async fn read_head_and_recent() {
        let store = InMemoryLogStore::new();
        let conversation = ConversationId::random();
        assert_eq!(store.head(conversation).await.unwrap(), SequenceNumber::ZERO);

        for seq in 1..=5 {
            store.append(&message(conversation, seq)).await.unwrap();
        }
        // 其他会话的消息互不影响
        store
            .append(&message(ConversationId::random(), 1))
            .await
            .unwrap();

        let batch = store
            .read(conversation, SequenceNumber::new(2), 2)
            .await
            .unwrap();
        let sequences: Vec<u64> = batch.iter().map(|m| m.sequence.value()).collect();
        assert_eq!(sequences, vec![2, 3]);

        assert_eq!(store.head(conversation).await.unwrap(), SequenceNumber::new(5));

        let recent = store.recent(conversation, 3).await.unwrap();
        let sequences: Vec<u64> = recent.iter().map(|m| m.sequence.value()).collect();
        assert_eq!(sequences, vec![5, 4, 3]);
    }
}
