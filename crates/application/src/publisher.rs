//! 异步发布器
//!
//! 持久化成功后的消息在这里排队发布到广播总线。按会话哈希分片，
//! 同一会话的消息由同一个工作者按入队顺序发布。发布失败只记录日志，
//! 永远不会反馈给发送方：订阅者可以从日志重放补齐。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use config::PipelineConfig;
use domain::{ConversationId, Message};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::bus::BroadcastBus;
use crate::error::BusError;
use crate::retry::{retry_async, Backoff, RetryPolicy};

/// 发布重试策略：有上限的指数退避
pub type PublishRetryPolicy = RetryPolicy;

impl RetryPolicy {
    pub fn for_publish(config: &PipelineConfig) -> Self {
        RetryPolicy::new(
            config.publish_max_attempts,
            Backoff::exponential(config.publish_base_delay(), config.publish_max_delay()),
        )
    }
}

/// 会话到分片的映射，发布器和分发器共用
pub(crate) fn shard_of(conversation: ConversationId, shards: usize) -> usize {
    (conversation.as_uuid().as_u128() % shards.max(1) as u128) as usize
}

#[derive(Debug, Default)]
struct PublisherStats {
    published: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublisherStatsSnapshot {
    pub published: u64,
    pub retried: u64,
    /// 重试预算耗尽的消息数
    pub exhausted: u64,
    /// 队列已满、未入队的消息数
    pub rejected: u64,
}

pub struct Publisher {
    shards: Vec<mpsc::Sender<Message>>,
    stats: Arc<PublisherStats>,
}

impl Publisher {
    /// 启动分片工作者；所有 `Publisher` 句柄被丢弃后工作者在清空队列后退出
    pub fn start(
        bus: Arc<dyn BroadcastBus>,
        policy: PublishRetryPolicy,
        shard_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let stats = Arc::new(PublisherStats::default());
        let shards = (0..shard_count.max(1))
            .map(|index| {
                let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
                tokio::spawn(run_shard(
                    index,
                    receiver,
                    Arc::clone(&bus),
                    policy.clone(),
                    Arc::clone(&stats),
                ));
                sender
            })
            .collect();
        Self { shards, stats }
    }

    /// 非阻塞入队，队列满时返回 false
    pub fn enqueue(&self, message: Message) -> bool {
        let shard = &self.shards[shard_of(message.conversation_id, self.shards.len())];
        match shard.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conversation_id = %message.conversation_id,
                    sequence = message.sequence.value(),
                    "发布队列已满，消息只能通过日志重放送达"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conversation_id = %message.conversation_id,
                    sequence = message.sequence.value(),
                    "发布工作者已停止"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.stats.published.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}

async fn run_shard(
    index: usize,
    mut receiver: mpsc::Receiver<Message>,
    bus: Arc<dyn BroadcastBus>,
    policy: PublishRetryPolicy,
    stats: Arc<PublisherStats>,
) {
    debug!(shard = index, "发布工作者启动");
    while let Some(message) = receiver.recv().await {
        let result = retry_async(
            &policy,
            |_: &BusError| true,
            |attempt| {
                let bus = Arc::clone(&bus);
                let message = &message;
                let stats = &stats;
                async move {
                    if attempt > 1 {
                        stats.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    bus.publish(message).await.inspect_err(|err| {
                        warn!(
                            conversation_id = %message.conversation_id,
                            sequence = message.sequence.value(),
                            attempt,
                            error = %err,
                            "发布消息失败"
                        );
                    })
                }
            },
        )
        .await;

        match result {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                stats.exhausted.fetch_add(1, Ordering::Relaxed);
                error!(
                    event = "publish_budget_exhausted",
                    conversation_id = %message.conversation_id,
                    sequence = message.sequence.value(),
                    trace = %message.trace,
                    attempts = policy.max_attempts,
                    error = %err,
                    "发布重试预算耗尽，订阅者将通过日志重放补齐"
                );
            }
        }
    }
    debug!(shard = index, "发布工作者退出");
}
