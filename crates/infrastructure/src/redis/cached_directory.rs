//! 带 Redis 缓存的会话目录
//!
//! 按 id 缓存整条会话记录，更新后立即刷新缓存；
//! 缓存不可用时直接回落到底层目录，只记录告警。

use std::sync::Arc;
use std::time::Duration;

use application::ConversationDirectory;
use async_trait::async_trait;
use domain::{Conversation, ConversationId, ParticipantId, StoreResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::error::RedisResult;

pub struct CachedConversationDirectory {
    inner: Arc<dyn ConversationDirectory>,
    cache: ConnectionManager,
    ttl: Duration,
}

impl CachedConversationDirectory {
    pub fn new(inner: Arc<dyn ConversationDirectory>, cache: ConnectionManager, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    fn cache_key(id: ConversationId) -> String {
        format!("conversation_meta:{}", id)
    }

    async fn cached(&self, id: ConversationId) -> RedisResult<Option<Conversation>> {
        let mut conn = self.cache.clone();
        let raw: Option<String> = conn.get(Self::cache_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, conversation: &Conversation) -> RedisResult<()> {
        let json = serde_json::to_string(conversation)?;
        let mut conn = self.cache.clone();
        let _: () = conn
            .set_ex(Self::cache_key(conversation.id), json, self.ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn evict(&self, id: ConversationId) -> RedisResult<()> {
        let mut conn = self.cache.clone();
        let _: () = conn.del(Self::cache_key(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationDirectory for CachedConversationDirectory {
    async fn create(&self, conversation: &Conversation) -> StoreResult<()> {
        self.inner.create(conversation).await?;
        if let Err(err) = self.store(conversation).await {
            warn!(conversation_id = %conversation.id, error = %err, "写入会话缓存失败");
        }
        Ok(())
    }

    async fn find(&self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        match self.cached(id).await {
            Ok(Some(conversation)) => {
                debug!(conversation_id = %id, "会话缓存命中");
                return Ok(Some(conversation));
            }
            Ok(None) => {}
            Err(err) => warn!(conversation_id = %id, error = %err, "读取会话缓存失败"),
        }

        let found = self.inner.find(id).await?;
        if let Some(conversation) = &found {
            if let Err(err) = self.store(conversation).await {
                warn!(conversation_id = %id, error = %err, "写入会话缓存失败");
            }
        }
        Ok(found)
    }

    async fn update(&self, conversation: &Conversation) -> StoreResult<()> {
        self.inner.update(conversation).await?;
        if let Err(err) = self.store(conversation).await {
            warn!(conversation_id = %conversation.id, error = %err, "刷新会话缓存失败，尝试删除旧条目");
            if let Err(err) = self.evict(conversation.id).await {
                warn!(conversation_id = %conversation.id, error = %err, "删除会话缓存失败");
            }
        }
        Ok(())
    }

    async fn list(&self, page: usize, size: usize) -> StoreResult<Vec<Conversation>> {
        self.inner.list(page, size).await
    }

    async fn conversations_of(
        &self,
        participant: ParticipantId,
    ) -> StoreResult<Vec<ConversationId>> {
        // 成员关系随会话创建和更新变化，不缓存
        self.inner.conversations_of(participant).await
    }
}
