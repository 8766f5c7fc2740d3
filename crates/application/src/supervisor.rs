//! 投递监督器
//!
//! 每个连接会话一个任务，负责把消息按会话内序列号顺序写入传输层：
//!
//! - `CatchingUp`：从游标（最后确认位置）之后分批重放日志；期间到达的实时消息
//!   缓存在有界缓冲区里，重放结束后去重并在连续时冲刷。
//! - `Live`：直接消费投递通道。重复序列号跳过，连续的投递，出现空洞则缓存并回到追赶。
//! - `Closed`：取消、传输层断开或投递通道关闭后进入，不再恢复。
//!
//! 存储读取失败时保持在 `CatchingUp` 并退避重试。
//! 会话被移出某个会话（conversation）后，该会话的游标、缓冲和待重放标记一并丢弃。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use config::DeliveryConfig;
use domain::{ConversationId, Message, SequenceNumber, StoreResult};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::log_store::LogStore;
use crate::receipts::ReceiptStore;
use crate::registry::Session;
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    CatchingUp,
    Live,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// 追赶期间缓存的实时消息上限（整个会话共享）
    pub catch_up_buffer: usize,
    pub replay_batch_size: usize,
    /// 存储读取失败后的初始重试间隔，最多退避到 8 倍
    pub replay_retry_delay: Duration,
}

impl From<&DeliveryConfig> for SupervisorSettings {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            catch_up_buffer: config.catch_up_buffer.max(1),
            replay_batch_size: config.replay_batch_size.max(1),
            replay_retry_delay: config.replay_retry_delay(),
        }
    }
}

/// 会话已经结束，监督器退出
#[derive(Debug)]
struct SessionClosed;

pub struct DeliverySupervisor {
    session: Arc<Session>,
    inbox: mpsc::Receiver<Message>,
    transport: mpsc::Sender<Message>,
    log: Arc<dyn LogStore>,
    receipts: Arc<dyn ReceiptStore>,
    settings: SupervisorSettings,
    state: watch::Sender<SupervisorState>,
    cancel: CancellationToken,
    store_backoff: Backoff,
    /// 每个会话已写入传输层的最高序列号
    cursors: HashMap<ConversationId, SequenceNumber>,
    /// 需要从日志重放的会话
    pending: BTreeSet<ConversationId>,
    buffered: HashMap<ConversationId, BTreeMap<SequenceNumber, Message>>,
    buffered_len: usize,
}

impl DeliverySupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        inbox: mpsc::Receiver<Message>,
        transport: mpsc::Sender<Message>,
        log: Arc<dyn LogStore>,
        receipts: Arc<dyn ReceiptStore>,
        settings: SupervisorSettings,
        state: watch::Sender<SupervisorState>,
        cancel: CancellationToken,
    ) -> Self {
        let store_backoff =
            Backoff::exponential(settings.replay_retry_delay, settings.replay_retry_delay * 8);
        Self {
            session,
            inbox,
            transport,
            log,
            receipts,
            settings,
            state,
            cancel,
            store_backoff,
            cursors: HashMap::new(),
            pending: BTreeSet::new(),
            buffered: HashMap::new(),
            buffered_len: 0,
        }
    }

    /// 运行直到会话关闭
    pub async fn run(self) {
        let span = info_span!(
            "delivery",
            session_id = %self.session.session_id(),
            participant_id = %self.session.participant_id(),
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        // 每个会话都先从最后确认的位置追赶
        self.pending.extend(self.session.conversations());
        info!(conversations = self.pending.len(), "投递监督器启动");

        match self.drive().await {
            Ok(()) => {}
            Err(SessionClosed) => debug!("会话已关闭，停止投递"),
        }

        self.set_state(SupervisorState::Closed);
        info!("投递监督器退出");
    }

    async fn drive(&mut self) -> Result<(), SessionClosed> {
        loop {
            self.absorb_behind();
            if !self.pending.is_empty() {
                self.set_state(SupervisorState::CatchingUp);
                self.catch_up().await?;
                continue;
            }

            self.set_state(SupervisorState::Live);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionClosed),
                _ = self.transport.closed() => return Err(SessionClosed),
                _ = self.session.behind_signal() => {}
                next = self.inbox.recv() => match next {
                    Some(message) => self.absorb(message).await?,
                    None => return Err(SessionClosed),
                },
            }
        }
    }

    async fn catch_up(&mut self) -> Result<(), SessionClosed> {
        while let Some(conversation) = self.pending.first().copied() {
            if !self.session.is_member(conversation) {
                self.forget(conversation);
                continue;
            }
            self.replay(conversation).await?;
            self.pending.remove(&conversation);
            self.flush(conversation).await?;
            self.absorb_behind();
            self.drain_inbox().await?;
        }
        Ok(())
    }

    /// 从游标之后分批读取日志直到读到不满一批
    async fn replay(&mut self, conversation: ConversationId) -> Result<(), SessionClosed> {
        if !self.cursors.contains_key(&conversation) {
            let participant = self.session.participant_id();
            let receipts = Arc::clone(&self.receipts);
            let acknowledged = self
                .with_store_retry("last_acknowledged", || {
                    receipts.last_acknowledged(participant, conversation)
                })
                .await?;
            self.cursors.insert(conversation, acknowledged);
            self.session.record_delivered(conversation, acknowledged);
        }

        let batch_size = self.settings.replay_batch_size;
        loop {
            let from = self.cursor(conversation).next();
            let log = Arc::clone(&self.log);
            let batch = self
                .with_store_retry("read", || log.read(conversation, from, batch_size))
                .await?;
            let exhausted = batch.len() < batch_size;
            debug!(
                conversation_id = %conversation,
                from = from.value(),
                count = batch.len(),
                "重放日志"
            );

            for message in batch {
                let cursor = self.cursor(conversation);
                if message.sequence <= cursor {
                    continue;
                }
                if !message.sequence.follows(cursor) {
                    warn!(
                        conversation_id = %conversation,
                        expected = cursor.next().value(),
                        found = message.sequence.value(),
                        "日志中存在空洞，跳过缺失的序列号"
                    );
                }
                self.emit(message).await?;
            }

            // 重放期间到达的实时消息进入缓冲区，避免投递通道溢出
            self.drain_inbox().await?;
            if exhausted {
                return Ok(());
            }
        }
    }

    /// 处理一条实时消息
    async fn absorb(&mut self, message: Message) -> Result<(), SessionClosed> {
        let conversation = message.conversation_id;
        if !self.session.is_member(conversation) {
            debug!(
                conversation_id = %conversation,
                sequence = message.sequence.value(),
                "已不是成员，丢弃消息"
            );
            self.forget(conversation);
            return Ok(());
        }
        let Some(cursor) = self.cursors.get(&conversation).copied() else {
            // 新加入的会话，尚未初始化游标
            self.buffer(message);
            self.pending.insert(conversation);
            return Ok(());
        };

        if message.sequence <= cursor {
            debug!(
                conversation_id = %conversation,
                sequence = message.sequence.value(),
                "跳过已投递的消息"
            );
            return Ok(());
        }
        if self.pending.contains(&conversation) {
            self.buffer(message);
            return Ok(());
        }
        if message.sequence.follows(cursor) {
            self.emit(message).await?;
            return self.flush(conversation).await;
        }

        debug!(
            conversation_id = %conversation,
            expected = cursor.next().value(),
            received = message.sequence.value(),
            "实时消息出现空洞，转入追赶"
        );
        self.buffer(message);
        self.pending.insert(conversation);
        Ok(())
    }

    /// 冲刷缓冲区中与游标连续的消息；仍有空洞时标记为待重放
    async fn flush(&mut self, conversation: ConversationId) -> Result<(), SessionClosed> {
        loop {
            let cursor = self.cursor(conversation);
            let popped = self
                .buffered
                .get_mut(&conversation)
                .and_then(|buffer| buffer.pop_first());
            let Some((sequence, message)) = popped else {
                self.buffered.remove(&conversation);
                return Ok(());
            };
            self.buffered_len -= 1;

            if sequence <= cursor {
                continue;
            }
            if sequence.follows(cursor) {
                self.emit(message).await?;
                continue;
            }

            self.buffered
                .entry(conversation)
                .or_default()
                .insert(sequence, message);
            self.buffered_len += 1;
            self.pending.insert(conversation);
            return Ok(());
        }
    }

    fn buffer(&mut self, message: Message) {
        let conversation = message.conversation_id;
        let duplicate = self
            .buffered
            .get(&conversation)
            .is_some_and(|buffer| buffer.contains_key(&message.sequence));
        if duplicate {
            return;
        }

        if self.buffered_len >= self.settings.catch_up_buffer {
            // 缓存的消息都已持久化，丢弃后重新重放即可
            warn!(
                buffered = self.buffered_len,
                "追赶缓冲区已满，丢弃缓存并重新重放"
            );
            let dropped: Vec<ConversationId> = self.buffered.drain().map(|(c, _)| c).collect();
            self.buffered_len = 0;
            self.pending.extend(dropped);
            self.pending.insert(conversation);
            return;
        }

        self.buffered
            .entry(conversation)
            .or_default()
            .insert(message.sequence, message);
        self.buffered_len += 1;
    }

    async fn drain_inbox(&mut self) -> Result<(), SessionClosed> {
        loop {
            match self.inbox.try_recv() {
                Ok(message) => self.absorb(message).await?,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(SessionClosed),
            }
        }
    }

    /// 丢弃已离开会话的全部投递状态
    fn forget(&mut self, conversation: ConversationId) {
        self.pending.remove(&conversation);
        self.cursors.remove(&conversation);
        if let Some(buffer) = self.buffered.remove(&conversation) {
            self.buffered_len -= buffer.len();
        }
    }

    fn absorb_behind(&mut self) {
        for conversation in self.session.take_behind() {
            self.pending.insert(conversation);
        }
    }

    async fn emit(&mut self, message: Message) -> Result<(), SessionClosed> {
        let conversation = message.conversation_id;
        let sequence = message.sequence;
        // 先登记再发送，客户端收到后立即确认也不会越过登记的位置
        self.session.record_delivered(conversation, sequence);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionClosed),
            sent = self.transport.send(message) => sent.map_err(|_| SessionClosed)?,
        }
        self.cursors.insert(conversation, sequence);
        Ok(())
    }

    fn cursor(&self, conversation: ConversationId) -> SequenceNumber {
        self.cursors
            .get(&conversation)
            .copied()
            .unwrap_or(SequenceNumber::ZERO)
    }

    /// 存储操作失败时退避重试，直到成功或会话关闭
    async fn with_store_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, SessionClosed>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut failures = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionClosed),
                result = op() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    let delay = self.store_backoff.delay_at(failures);
                    warn!(
                        operation,
                        failures,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "存储读取失败，稍后重试"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(SessionClosed),
                        _ = self.transport.closed() => return Err(SessionClosed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn set_state(&self, next: SupervisorState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = ?next, "投递状态切换");
        }
    }
}
