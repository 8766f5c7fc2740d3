//! 基于 Redis 租约的跨实例序列号分配
//!
//! 写入某个会话之前先用 `SET NX PX` 取得该会话的写租约，持有期间在日志头部之后条件追加，
//! 完成后用脚本比较令牌再删除。租约只减少冲突：即使租约过期被他人取得，
//! 日志的条件追加仍然保证同一序列号只写入一次。
//! 提交回调在释放租约之前执行。

use std::sync::Arc;
use std::time::Duration;

use application::{Backoff, LogStore, OnCommit, OptimisticSequencer, SequenceError, Sequencer};
use async_trait::async_trait;
use config::RedisConfig;
use domain::{ConversationId, Message, MessageDraft};
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::RedisError;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisLeaseSequencer {
    conn: ConnectionManager,
    appender: OptimisticSequencer,
    lease_ttl: Duration,
    lease_wait: Duration,
    poll: Backoff,
}

impl RedisLeaseSequencer {
    pub fn new(
        conn: ConnectionManager,
        store: Arc<dyn LogStore>,
        config: &RedisConfig,
        max_conflicts: u32,
    ) -> Self {
        Self {
            conn,
            appender: OptimisticSequencer::new(store, max_conflicts),
            lease_ttl: Duration::from_millis(config.lease_ttl_ms.max(1)),
            lease_wait: Duration::from_millis(config.lease_wait_ms),
            poll: Backoff::exponential(Duration::from_millis(5), Duration::from_millis(100))
                .with_jitter(),
        }
    }

    fn lease_key(conversation: ConversationId) -> String {
        format!("sequence_lease:{}", conversation)
    }

    fn token() -> String {
        format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
    }

    async fn try_acquire(&self, key: &str, token: &str) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease_ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn acquire(&self, conversation: ConversationId) -> Result<String, SequenceError> {
        let key = Self::lease_key(conversation);
        let token = Self::token();
        let deadline = Instant::now() + self.lease_wait;
        let mut attempt = 0u32;
        loop {
            if self.try_acquire(&key, &token).await? {
                return Ok(token);
            }
            attempt += 1;
            if Instant::now() >= deadline {
                return Err(SequenceError::LeaseUnavailable(format!(
                    "lease for {} held elsewhere after {} attempts",
                    conversation, attempt
                )));
            }
            tokio::time::sleep(self.poll.delay_at(attempt)).await;
        }
    }

    async fn release(&self, conversation: ConversationId, token: &str) {
        let mut conn = self.conn.clone();
        let result: Result<i64, redis::RedisError> = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lease_key(conversation))
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(1) => {}
            Ok(_) => debug!(conversation_id = %conversation, "租约已过期，无需释放"),
            // 释放失败时租约会自然过期
            Err(err) => warn!(conversation_id = %conversation, error = %err, "释放序列号租约失败"),
        }
    }
}

#[async_trait]
impl Sequencer for RedisLeaseSequencer {
    async fn append_next_with(
        &self,
        draft: MessageDraft,
        on_commit: OnCommit<'_>,
    ) -> Result<Message, SequenceError> {
        let conversation = draft.conversation_id;
        let token = self.acquire(conversation).await?;
        let result = self.appender.append_next_with(draft, on_commit).await;
        self.release(conversation, &token).await;
        result
    }
}
