//! 序列号分配
//!
//! 每个会话的序列号从 1 开始严格递增且无空洞。分配与持久化是同一个动作：
//! 先预留下一个序列号，再对日志做条件追加；追加失败不会推进计数器。
//!
//! 提交回调在持有会话写锁时执行，同一会话的回调严格按序列号顺序调用，
//! 接入管线在这里把消息放进发布队列。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use domain::{ConversationId, Message, MessageDraft, SequenceNumber};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SequenceError;
use crate::log_store::{AppendOutcome, LogStore};
use crate::retry::Backoff;

/// 追加成功后、释放会话写锁前调用
pub type OnCommit<'a> = &'a (dyn Fn(&Message) + Send + Sync);

#[async_trait]
pub trait Sequencer: Send + Sync {
    /// 原子地分配下一个序列号并持久化消息，提交后在锁内调用 `on_commit`
    async fn append_next_with(
        &self,
        draft: MessageDraft,
        on_commit: OnCommit<'_>,
    ) -> Result<Message, SequenceError>;

    async fn append_next(&self, draft: MessageDraft) -> Result<Message, SequenceError> {
        self.append_next_with(draft, &|_: &Message| {}).await
    }
}

fn lock_for<T: Default>(
    locks: &DashMap<ConversationId, Arc<Mutex<T>>>,
    conversation: ConversationId,
) -> Arc<Mutex<T>> {
    Arc::clone(
        locks
            .entry(conversation)
            .or_insert_with(|| Arc::new(Mutex::new(T::default())))
            .value(),
    )
}

/// 进程内租约分配器
///
/// 每个会话一把异步锁，锁内缓存当前最大序列号（首次使用时从日志读取）。
/// 条件追加遇到 `Occupied` 说明有其他写入者，丢弃缓存重新同步后重试。
pub struct LeasedSequencer {
    store: Arc<dyn LogStore>,
    leases: DashMap<ConversationId, Arc<Mutex<Option<SequenceNumber>>>>,
    max_conflicts: u32,
}

impl LeasedSequencer {
    pub fn new(store: Arc<dyn LogStore>, max_conflicts: u32) -> Self {
        Self {
            store,
            leases: DashMap::new(),
            max_conflicts: max_conflicts.max(1),
        }
    }
}

#[async_trait]
impl Sequencer for LeasedSequencer {
    async fn append_next_with(
        &self,
        draft: MessageDraft,
        on_commit: OnCommit<'_>,
    ) -> Result<Message, SequenceError> {
        let conversation = draft.conversation_id;
        let lease = lock_for(&self.leases, conversation);
        let mut head = lease.lock().await;

        let mut conflicts = 0u32;
        loop {
            let current = match *head {
                Some(current) => current,
                None => {
                    let current = self.store.head(conversation).await?;
                    *head = Some(current);
                    current
                }
            };

            let message = draft.sequenced(current.next());
            match self.store.append(&message).await {
                Ok(AppendOutcome::Committed) => {
                    *head = Some(message.sequence);
                    on_commit(&message);
                    return Ok(message);
                }
                Ok(AppendOutcome::Occupied) => {
                    *head = None;
                    conflicts += 1;
                    debug!(
                        conversation_id = %conversation,
                        sequence = message.sequence.value(),
                        conflicts,
                        "序列号已被占用，重新同步"
                    );
                    if conflicts >= self.max_conflicts {
                        return Err(SequenceError::Contended {
                            conversation,
                            attempts: conflicts,
                        });
                    }
                }
                Err(err) => {
                    // 写入结果未知（例如超时），下次从日志重新读取
                    *head = None;
                    return Err(err.into());
                }
            }
        }
    }
}

/// 乐观分配器：读取日志头部，在 head+1 处条件追加，冲突时退避重试
///
/// 本进程内同一会话的写入者仍然排队，与其他实例之间只依赖条件追加。
/// 与 [`LeasedSequencer`] 不同，每次都从日志重新读取头部，不缓存。
pub struct OptimisticSequencer {
    store: Arc<dyn LogStore>,
    local: DashMap<ConversationId, Arc<Mutex<()>>>,
    max_attempts: u32,
    backoff: Backoff,
}

impl OptimisticSequencer {
    pub fn new(store: Arc<dyn LogStore>, max_attempts: u32) -> Self {
        Self {
            store,
            local: DashMap::new(),
            max_attempts: max_attempts.max(1),
            backoff: Backoff::exponential(Duration::from_millis(2), Duration::from_millis(50))
                .with_jitter(),
        }
    }
}

#[async_trait]
impl Sequencer for OptimisticSequencer {
    async fn append_next_with(
        &self,
        draft: MessageDraft,
        on_commit: OnCommit<'_>,
    ) -> Result<Message, SequenceError> {
        let conversation = draft.conversation_id;
        let local = lock_for(&self.local, conversation);
        let _guard = local.lock().await;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let head = self.store.head(conversation).await?;
            let message = draft.sequenced(head.next());
            match self.store.append(&message).await? {
                AppendOutcome::Committed => {
                    on_commit(&message);
                    return Ok(message);
                }
                AppendOutcome::Occupied => {
                    if attempt >= self.max_attempts {
                        return Err(SequenceError::Contended {
                            conversation,
                            attempts: attempt,
                        });
                    }
                    tokio::time::sleep(self.backoff.delay_at(attempt)).await;
                }
            }
        }
    }
}
