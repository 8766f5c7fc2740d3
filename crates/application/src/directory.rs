use std::collections::HashMap;

use async_trait::async_trait;
use domain::{Conversation, ConversationId, ParticipantId, StoreResult};
use tokio::sync::RwLock;

/// 会话目录：会话元数据与成员关系
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()>;

    async fn find(&self, id: ConversationId) -> StoreResult<Option<Conversation>>;

    /// 覆盖已有会话的元数据与成员
    async fn update(&self, conversation: &Conversation) -> StoreResult<()>;

    /// 按创建时间分页列出会话，`page` 从 0 开始
    async fn list(&self, page: usize, size: usize) -> StoreResult<Vec<Conversation>>;

    /// 参与者所属的全部会话
    async fn conversations_of(&self, participant: ParticipantId)
        -> StoreResult<Vec<ConversationId>>;
}

#[derive(Default)]
pub struct InMemoryConversationDirectory {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl InMemoryConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryConversationDirectory {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn find(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        if let Some(existing) = self.conversations.write().await.get_mut(&conversation.id) {
            *existing = conversation.clone();
        }
        Ok(())
    }

    async fn list(&self, page: usize, size: usize) -> StoreResult<Vec<Conversation>> {
        let conversations = self.conversations.read().await;
        let mut all: Vec<&Conversation> = conversations.values().collect();
        all.sort_by_key(|conversation| (conversation.created_at, conversation.id));
        Ok(all
            .into_iter()
            .skip(page.saturating_mul(size))
            .take(size)
            .cloned()
            .collect())
    }

    async fn conversations_of(
        &self,
        participant: ParticipantId,
    ) -> StoreResult<Vec<ConversationId>> {
        let conversations = self.conversations.read().await;
        let mut ids: Vec<(time::OffsetDateTime, ConversationId)> = conversations
            .values()
            .filter(|conversation| conversation.is_participant(participant))
            .map(|conversation| (conversation.created_at, conversation.id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}
