//! 网关门面
//!
//! 传输层（不在本 crate 内）通过这里提交消息、建立会话、确认送达。
//! 网关把接入管线、连接注册表、扇出分发器和投递监督器组合在一起。

use std::sync::Arc;

use config::AppConfig;
use dashmap::DashMap;
use domain::{
    Conversation, ConversationId, ConversationKind, ConversationUpdate, DeliveryReceipt,
    DomainError, Message, ParticipantId, SequenceNumber, SessionId, TraceContext,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::BroadcastBus;
use crate::clock::Clock;
use crate::directory::ConversationDirectory;
use crate::dispatcher::{Dispatcher, DispatcherStatsSnapshot};
use crate::error::GatewayError;
use crate::ingest::{IngestCommand, IngestPipeline};
use crate::log_store::LogStore;
use crate::publisher::{PublishRetryPolicy, Publisher, PublisherStatsSnapshot};
use crate::receipts::ReceiptStore;
use crate::registry::{ConnectionRegistry, Session};
use crate::sequencer::Sequencer;
use crate::supervisor::{DeliverySupervisor, SupervisorSettings, SupervisorState};

/// 历史查询条数上限
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// 会话列表每页条数上限
pub const MAX_PAGE_SIZE: usize = 100;

/// 网关依赖的外部适配器
pub struct GatewayDependencies {
    pub log: Arc<dyn LogStore>,
    pub bus: Arc<dyn BroadcastBus>,
    pub directory: Arc<dyn ConversationDirectory>,
    pub receipts: Arc<dyn ReceiptStore>,
    pub sequencer: Arc<dyn Sequencer>,
    pub clock: Arc<dyn Clock>,
}

/// 一个会话的出站消息流，交给传输层写到客户端
pub struct DeliveryStream {
    session_id: SessionId,
    participant_id: ParticipantId,
    receiver: mpsc::Receiver<Message>,
    state: watch::Receiver<SupervisorState>,
}

impl DeliveryStream {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// 下一条要写给客户端的消息；会话关闭后返回 `None`
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }
}

struct GatewayInner {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    ingest: IngestPipeline,
    log: Arc<dyn LogStore>,
    directory: Arc<dyn ConversationDirectory>,
    receipts: Arc<dyn ReceiptStore>,
    clock: Arc<dyn Clock>,
    settings: SupervisorSettings,
    channel_capacity: usize,
    transport_capacity: usize,
    supervisors: DashMap<SessionId, CancellationToken>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// 启动发布器与分发器；必须在 tokio 运行时内调用
    pub fn start(deps: GatewayDependencies, config: &AppConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::start(
            Arc::clone(&deps.bus),
            Arc::clone(&registry),
            &config.dispatcher,
        );
        let publisher = Publisher::start(
            Arc::clone(&deps.bus),
            PublishRetryPolicy::for_publish(&config.pipeline),
            config.pipeline.publisher_shards,
            config.pipeline.publish_queue_capacity,
        );
        let ingest = IngestPipeline::new(
            Arc::clone(&deps.directory),
            deps.sequencer,
            publisher,
            Arc::clone(&deps.clock),
            config.pipeline.max_payload_bytes,
        );

        Self {
            inner: Arc::new(GatewayInner {
                registry,
                dispatcher,
                ingest,
                log: deps.log,
                directory: deps.directory,
                receipts: deps.receipts,
                clock: deps.clock,
                settings: SupervisorSettings::from(&config.delivery),
                channel_capacity: config.delivery.channel_capacity.max(1),
                transport_capacity: config.delivery.transport_capacity.max(1),
                supervisors: DashMap::new(),
            }),
        }
    }

    /// 提交一条消息，返回持久化后的序列号
    pub async fn submit(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
        payload: Vec<u8>,
        trace: TraceContext,
    ) -> Result<SequenceNumber, GatewayError> {
        let session = self.session(session_id)?;
        let message = self
            .inner
            .ingest
            .ingest(IngestCommand {
                conversation_id,
                sender_id: session.participant_id(),
                payload,
                trace,
            })
            .await?;
        Ok(message.sequence)
    }

    /// 为参与者建立会话并启动投递监督器
    pub async fn attach(&self, participant_id: ParticipantId) -> Result<DeliveryStream, GatewayError> {
        let conversations = self.inner.directory.conversations_of(participant_id).await?;

        let (delivery_tx, delivery_rx) = mpsc::channel(self.inner.channel_capacity);
        let session_id = SessionId::random();
        let session = Arc::new(Session::new(
            participant_id,
            session_id,
            conversations,
            delivery_tx,
        ));
        let activated = self.inner.registry.register(Arc::clone(&session))?;
        for conversation in activated {
            self.inner.dispatcher.activate(conversation).await;
        }

        let (transport_tx, transport_rx) = mpsc::channel(self.inner.transport_capacity);
        let (state_tx, state_rx) = watch::channel(SupervisorState::CatchingUp);
        let cancel = CancellationToken::new();
        self.inner.supervisors.insert(session_id, cancel.clone());

        let supervisor = DeliverySupervisor::new(
            session,
            delivery_rx,
            transport_tx,
            Arc::clone(&self.inner.log),
            Arc::clone(&self.inner.receipts),
            self.inner.settings.clone(),
            state_tx,
            cancel,
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            supervisor.run().await;
            // 传输层断开时监督器自行退出，这里补做注销
            inner.release(session_id).await;
        });

        info!(
            session_id = %session_id,
            participant_id = %participant_id,
            "会话已建立"
        );
        Ok(DeliveryStream {
            session_id,
            participant_id,
            receiver: transport_rx,
            state: state_rx,
        })
    }

    /// 客户端确认已收到某条消息
    pub async fn acknowledge(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
        sequence: SequenceNumber,
    ) -> Result<(), GatewayError> {
        let session = self.session(session_id)?;
        if !session.is_member(conversation_id) {
            return Err(GatewayError::NotMember(conversation_id));
        }
        let delivered = session.delivered(conversation_id);
        if sequence > delivered {
            return Err(GatewayError::AckAheadOfDelivery {
                conversation: conversation_id,
                sequence,
                delivered,
            });
        }
        // 重复或更旧的确认不产生任何写入
        if session.acknowledge(conversation_id, sequence) {
            let receipt = DeliveryReceipt::new(
                session_id,
                session.participant_id(),
                conversation_id,
                sequence,
            );
            self.inner.receipts.record(&receipt).await?;
        }
        Ok(())
    }

    /// 关闭会话（幂等）
    pub async fn detach(&self, session_id: SessionId) {
        if let Some((_, cancel)) = self.inner.supervisors.remove(&session_id) {
            cancel.cancel();
        }
        self.inner.release(session_id).await;
    }

    /// 创建会话并让在线成员立即开始接收
    pub async fn open_conversation(
        &self,
        kind: ConversationKind,
        participants: Vec<ParticipantId>,
    ) -> Result<Conversation, GatewayError> {
        let id = ConversationId::random();
        let now = self.inner.clock.now();
        let conversation = match kind {
            ConversationKind::Group { title, description } => {
                Conversation::new_group(id, title, description, participants, now)?
            }
            ConversationKind::Direct => match participants.as_slice() {
                [from, to] => Conversation::new_direct(id, *from, *to, now)?,
                _ => {
                    return Err(DomainError::validation_error(
                        "participants",
                        "direct conversation needs exactly two participants",
                    )
                    .into())
                }
            },
        };
        self.inner.directory.create(&conversation).await?;

        for participant in conversation.participants() {
            self.inner.join_online(*participant, conversation.id).await;
        }

        info!(
            conversation_id = %conversation.id,
            participants = conversation.participants().len(),
            "会话已创建"
        );
        Ok(conversation)
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, GatewayError> {
        self.inner
            .directory
            .find(conversation_id)
            .await?
            .ok_or(GatewayError::UnknownConversation(conversation_id))
    }

    /// 更新群组的标题、描述、管理员和成员。
    ///
    /// 新成员如果在线立即开始接收（从其回执位置重放），被移除的成员立即停止接收。
    pub async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        update: ConversationUpdate,
    ) -> Result<Conversation, GatewayError> {
        let mut conversation = self.conversation(conversation_id).await?;
        let change = conversation.update(update, self.inner.clock.now())?;
        self.inner.directory.update(&conversation).await?;

        // 不在线的成员没有需要清理的本地状态
        for participant in &change.removed {
            if let Ok(true) = self.inner.registry.unlink(*participant, conversation_id) {
                self.inner.dispatcher.deactivate(conversation_id).await;
            }
        }
        for participant in &change.added {
            self.inner.join_online(*participant, conversation_id).await;
        }

        info!(
            conversation_id = %conversation_id,
            added = change.added.len(),
            removed = change.removed.len(),
            "会话已更新"
        );
        Ok(conversation)
    }

    /// 按创建时间分页列出会话，`page` 从 0 开始
    pub async fn list_conversations(
        &self,
        page: usize,
        size: usize,
    ) -> Result<Vec<Conversation>, GatewayError> {
        if size == 0 || size > MAX_PAGE_SIZE {
            return Err(GatewayError::InvalidPageSize(size));
        }
        Ok(self.inner.directory.list(page, size).await?)
    }

    /// 最近的历史消息，最新的在前
    pub async fn history(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>, GatewayError> {
        if limit == 0 || limit > MAX_HISTORY_LIMIT {
            return Err(GatewayError::InvalidLimit(limit));
        }
        let session = self.session(session_id)?;
        if !session.is_member(conversation_id) {
            return Err(GatewayError::NotMember(conversation_id));
        }
        Ok(self.inner.log.recent(conversation_id, limit).await?)
    }

    /// 按序列号读取单条消息
    pub async fn message(
        &self,
        session_id: SessionId,
        conversation_id: ConversationId,
        sequence: SequenceNumber,
    ) -> Result<Message, GatewayError> {
        let session = self.session(session_id)?;
        if !session.is_member(conversation_id) {
            return Err(GatewayError::NotMember(conversation_id));
        }
        self.inner
            .log
            .get(conversation_id, sequence)
            .await?
            .ok_or(GatewayError::MessageNotFound {
                conversation: conversation_id,
                sequence,
            })
    }

    pub fn online_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStatsSnapshot {
        self.inner.dispatcher.stats()
    }

    pub fn publisher_stats(&self) -> PublisherStatsSnapshot {
        self.inner.ingest.publisher().stats()
    }

    /// 关闭全部会话并停止分发器
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionId> = self
            .inner
            .supervisors
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for session_id in sessions {
            self.detach(session_id).await;
        }
        self.inner.dispatcher.shutdown().await;
        info!("网关已关闭");
    }

    fn session(&self, session_id: SessionId) -> Result<Arc<Session>, GatewayError> {
        self.inner
            .registry
            .session_by_id(session_id)
            .ok_or(GatewayError::UnknownSession(session_id))
    }
}

impl GatewayInner {
    /// 在线参与者加入会话，并让监督器从回执位置开始重放
    async fn join_online(&self, participant: ParticipantId, conversation: ConversationId) {
        let Some(session) = self.registry.session(participant) else {
            return;
        };
        match self.registry.link(participant, conversation) {
            Ok(true) => self.dispatcher.activate(conversation).await,
            Ok(false) => {}
            Err(err) => {
                warn!(participant_id = %participant, error = %err, "会话关联失败");
                return;
            }
        }
        session.mark_behind(conversation);
    }

    /// 注销会话并停用不再有本地成员的会话订阅
    async fn release(&self, session_id: SessionId) {
        self.supervisors.remove(&session_id);
        let Some((session, deactivated)) = self.registry.deregister_session(session_id) else {
            return;
        };
        for conversation in deactivated {
            self.dispatcher.deactivate(conversation).await;
        }
        info!(
            session_id = %session_id,
            participant_id = %session.participant_id(),
            "会话已关闭"
        );
    }
}
