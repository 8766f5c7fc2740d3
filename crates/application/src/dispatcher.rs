//! 扇出分发器
//!
//! 本实例上每个有在线成员的会话持有一个总线订阅，由一个轻量的泵任务把消息
//! 转发到固定数量的分片工作者。分片工作者跟踪每个会话见过的最大序列号，
//! 丢弃重复消息、发现空洞，然后把消息非阻塞地提交给各个在线会话。
//! 这条路径上没有任何存储 I/O。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::DispatcherConfig;
use domain::{ConversationId, Message, SequenceNumber};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::BroadcastBus;
use crate::publisher::shard_of;
use crate::registry::{ConnectionRegistry, OfferOutcome};
use crate::retry::Backoff;

/// 分发器计数器
#[derive(Debug, Default)]
pub struct DispatcherStats {
    delivered: AtomicU64,
    behind: AtomicU64,
    gaps: AtomicU64,
    stale: AtomicU64,
    subscriptions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStatsSnapshot {
    /// 成功放入会话投递通道的次数
    pub delivered: u64,
    /// 因通道已满被标记为落后的次数
    pub behind: u64,
    /// 发现的序列号空洞数
    pub gaps: u64,
    /// 丢弃的重复或过期消息数
    pub stale: u64,
    /// 建立（含重建）的总线订阅数
    pub subscriptions: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            behind: self.behind.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
        }
    }
}

enum ShardCommand {
    Deliver(Message),
    /// 会话的订阅已取消，清除序列号跟踪
    Forget(ConversationId),
}

struct DispatcherInner {
    bus: Arc<dyn BroadcastBus>,
    registry: Arc<ConnectionRegistry>,
    shards: Vec<mpsc::Sender<ShardCommand>>,
    subscriptions: Mutex<HashMap<ConversationId, CancellationToken>>,
    stats: Arc<DispatcherStats>,
    resubscribe: Backoff,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// 启动分片工作者
    pub fn start(
        bus: Arc<dyn BroadcastBus>,
        registry: Arc<ConnectionRegistry>,
        config: &DispatcherConfig,
    ) -> Self {
        let stats = Arc::new(DispatcherStats::default());
        let shutdown = CancellationToken::new();
        let shards = (0..config.shard_count.max(1))
            .map(|index| {
                let (sender, receiver) = mpsc::channel(config.shard_inbox_capacity.max(1));
                tokio::spawn(run_shard(
                    index,
                    receiver,
                    Arc::clone(&registry),
                    Arc::clone(&stats),
                    shutdown.clone(),
                ));
                sender
            })
            .collect();

        info!(shards = config.shard_count, "扇出分发器已启动");
        Self {
            inner: Arc::new(DispatcherInner {
                bus,
                registry,
                shards,
                subscriptions: Mutex::new(HashMap::new()),
                stats,
                resubscribe: Backoff::exponential(
                    Duration::from_millis(100),
                    Duration::from_secs(5),
                ),
                shutdown,
            }),
        }
    }

    /// 会话在本实例上有在线成员时确保存在总线订阅
    pub async fn activate(&self, conversation: ConversationId) {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if subscriptions.contains_key(&conversation)
            || !self.inner.registry.has_local(conversation)
            || self.inner.shutdown.is_cancelled()
        {
            return;
        }

        let token = self.inner.shutdown.child_token();
        tokio::spawn(pump(Arc::clone(&self.inner), conversation, token.clone()));
        subscriptions.insert(conversation, token);
        debug!(conversation_id = %conversation, "会话已激活");
    }

    /// 最后一个本地成员离开后取消总线订阅
    pub async fn deactivate(&self, conversation: ConversationId) {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        if self.inner.registry.has_local(conversation) {
            return;
        }
        if let Some(token) = subscriptions.remove(&conversation) {
            token.cancel();
            let shard = &self.inner.shards[shard_of(conversation, self.inner.shards.len())];
            // 工作者已退出时无需清理
            let _ = shard.send(ShardCommand::Forget(conversation)).await;
            debug!(conversation_id = %conversation, "会话已停用");
        }
    }

    pub async fn is_subscribed(&self, conversation: ConversationId) -> bool {
        self.inner
            .subscriptions
            .lock()
            .await
            .contains_key(&conversation)
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// 停止全部泵任务与分片工作者
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.subscriptions.lock().await.clear();
        info!("扇出分发器已停止");
    }
}

/// 维持一个会话的总线订阅，断开后按指数退避重新订阅
async fn pump(inner: Arc<DispatcherInner>, conversation: ConversationId, token: CancellationToken) {
    let shard = inner.shards[shard_of(conversation, inner.shards.len())].clone();
    let mut failures = 0u32;

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            result = inner.bus.subscribe(conversation) => result,
        };

        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(err) => {
                failures += 1;
                let delay = inner.resubscribe.delay_at(failures);
                warn!(
                    conversation_id = %conversation,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "订阅会话频道失败"
                );
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        failures = 0;
        inner.stats.subscriptions.fetch_add(1, Ordering::Relaxed);
        // 订阅生效之前发布的消息只能从日志取得
        for session in inner.registry.sessions_for(conversation) {
            session.mark_behind(conversation);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(message) if message.conversation_id == conversation => {
                    if shard.send(ShardCommand::Deliver(message)).await.is_err() {
                        return;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        warn!(conversation_id = %conversation, "会话频道订阅中断，重新订阅");
    }
}

async fn run_shard(
    index: usize,
    mut inbox: mpsc::Receiver<ShardCommand>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<DispatcherStats>,
    shutdown: CancellationToken,
) {
    let mut last_seen: HashMap<ConversationId, SequenceNumber> = HashMap::new();

    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = inbox.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            ShardCommand::Forget(conversation) => {
                last_seen.remove(&conversation);
            }
            ShardCommand::Deliver(message) => {
                dispatch(&registry, &stats, &mut last_seen, message);
            }
        }
    }
    debug!(shard = index, "分发分片退出");
}

fn dispatch(
    registry: &ConnectionRegistry,
    stats: &DispatcherStats,
    last_seen: &mut HashMap<ConversationId, SequenceNumber>,
    message: Message,
) {
    let conversation = message.conversation_id;
    let sequence = message.sequence;

    if let Some(&last) = last_seen.get(&conversation) {
        if sequence <= last {
            stats.stale.fetch_add(1, Ordering::Relaxed);
            debug!(
                conversation_id = %conversation,
                sequence = sequence.value(),
                last_seen = last.value(),
                "丢弃重复消息"
            );
            return;
        }
        if !sequence.follows(last) {
            stats.gaps.fetch_add(1, Ordering::Relaxed);
            warn!(
                event = "sequence_gap_detected",
                conversation_id = %conversation,
                expected = last.next().value(),
                received = sequence.value(),
                trace = %message.trace,
                "检测到序列号空洞，本地会话转入追赶"
            );
            for session in registry.sessions_for(conversation) {
                session.mark_behind(conversation);
            }
        }
    }
    last_seen.insert(conversation, sequence);

    for session in registry.sessions_for(conversation) {
        match session.offer(message.clone()) {
            OfferOutcome::Delivered => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            OfferOutcome::Behind => {
                stats.behind.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session_id = %session.session_id(),
                    conversation_id = %conversation,
                    sequence = sequence.value(),
                    "投递通道已满，会话标记为落后"
                );
            }
            OfferOutcome::Closed => {}
        }
    }
}
