//! 连接注册表
//!
//! 记录本实例上在线的会话：按参与者 O(1) 查找，按会话 ID 查找，
//! 以及按会话（conversation）索引用于扇出。所有索引都是 `DashMap` 分片锁，
//! 热路径上没有全局锁。

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use domain::{ConversationId, Message, ParticipantId, SequenceNumber, SessionId};
use tokio::sync::{mpsc, Notify};

use crate::error::RegistryError;

/// 向会话投递通道提交消息的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Delivered,
    /// 通道已满，会话被标记为落后，由监督器从日志补齐
    Behind,
    /// 会话已关闭
    Closed,
}

/// 一个在线连接
pub struct Session {
    participant_id: ParticipantId,
    session_id: SessionId,
    delivery: mpsc::Sender<Message>,
    conversations: DashSet<ConversationId>,
    acknowledged: DashMap<ConversationId, SequenceNumber>,
    /// 监督器已交给传输层的最高序列号，确认不能越过它
    delivered: DashMap<ConversationId, SequenceNumber>,
    behind: DashSet<ConversationId>,
    wake: Notify,
}

impl Session {
    pub fn new(
        participant_id: ParticipantId,
        session_id: SessionId,
        conversations: impl IntoIterator<Item = ConversationId>,
        delivery: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            participant_id,
            session_id,
            delivery,
            conversations: conversations.into_iter().collect(),
            acknowledged: DashMap::new(),
            delivered: DashMap::new(),
            behind: DashSet::new(),
            wake: Notify::new(),
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversations(&self) -> Vec<ConversationId> {
        self.conversations.iter().map(|c| *c).collect()
    }

    pub fn is_member(&self, conversation: ConversationId) -> bool {
        self.conversations.contains(&conversation)
    }

    /// 非阻塞投递，从不等待
    pub fn offer(&self, message: Message) -> OfferOutcome {
        let conversation = message.conversation_id;
        match self.delivery.try_send(message) {
            Ok(()) => OfferOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mark_behind(conversation);
                OfferOutcome::Behind
            }
            Err(mpsc::error::TrySendError::Closed(_)) => OfferOutcome::Closed,
        }
    }

    /// 标记某个会话需要从日志补齐，并唤醒监督器
    pub fn mark_behind(&self, conversation: ConversationId) {
        self.behind.insert(conversation);
        self.wake.notify_one();
    }

    /// 取走全部落后标记
    pub fn take_behind(&self) -> Vec<ConversationId> {
        let pending: Vec<ConversationId> = self.behind.iter().map(|c| *c).collect();
        for conversation in &pending {
            self.behind.remove(conversation);
        }
        pending
    }

    /// 等待落后信号；通知先于等待发生时也不会丢失
    pub async fn behind_signal(&self) {
        self.wake.notified().await
    }

    /// 记录客户端确认，只会前进；返回是否推进了确认位置
    pub fn acknowledge(&self, conversation: ConversationId, sequence: SequenceNumber) -> bool {
        let mut entry = self
            .acknowledged
            .entry(conversation)
            .or_insert(SequenceNumber::ZERO);
        if sequence > *entry {
            *entry = sequence;
            true
        } else {
            false
        }
    }

    pub fn last_acknowledged(&self, conversation: ConversationId) -> SequenceNumber {
        self.acknowledged
            .get(&conversation)
            .map(|entry| *entry.value())
            .unwrap_or(SequenceNumber::ZERO)
    }

    /// 记录已交付到传输层的位置，只会前进
    pub fn record_delivered(&self, conversation: ConversationId, sequence: SequenceNumber) {
        let mut entry = self.delivered.entry(conversation).or_insert(sequence);
        if sequence > *entry {
            *entry = sequence;
        }
    }

    pub fn delivered(&self, conversation: ConversationId) -> SequenceNumber {
        self.delivered
            .get(&conversation)
            .map(|entry| *entry.value())
            .unwrap_or(SequenceNumber::ZERO)
    }

    fn join(&self, conversation: ConversationId) -> bool {
        self.conversations.insert(conversation)
    }

    fn leave(&self, conversation: ConversationId) -> bool {
        self.behind.remove(&conversation);
        self.conversations.remove(&conversation).is_some()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("participant_id", &self.participant_id)
            .field("session_id", &self.session_id)
            .field("conversations", &self.conversations.len())
            .finish()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    by_participant: DashMap<ParticipantId, Arc<Session>>,
    by_session: DashMap<SessionId, ParticipantId>,
    by_conversation: DashMap<ConversationId, HashSet<ParticipantId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册会话，返回因此在本实例上变为活跃的会话（conversation）
    pub fn register(&self, session: Arc<Session>) -> Result<Vec<ConversationId>, RegistryError> {
        let participant = session.participant_id();
        match self.by_participant.entry(participant) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateSession(participant));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
            }
        }
        self.by_session.insert(session.session_id(), participant);

        let mut activated = Vec::new();
        for conversation in session.conversations() {
            if self.index(participant, conversation) {
                activated.push(conversation);
            }
        }
        Ok(activated)
    }

    /// 注销参与者的会话（幂等），返回被移除的会话和因此变为不活跃的会话
    pub fn deregister(
        &self,
        participant: ParticipantId,
    ) -> Option<(Arc<Session>, Vec<ConversationId>)> {
        let (_, session) = self.by_participant.remove(&participant)?;
        Some(self.unindex(session))
    }

    /// 按会话 ID 注销；只移除该 ID 对应的会话，不影响同一参与者后来的新连接
    pub fn deregister_session(
        &self,
        session_id: SessionId,
    ) -> Option<(Arc<Session>, Vec<ConversationId>)> {
        let participant = *self.by_session.get(&session_id)?.value();
        let (_, session) = self
            .by_participant
            .remove_if(&participant, |_, session| session.session_id() == session_id)?;
        Some(self.unindex(session))
    }

    pub fn session(&self, participant: ParticipantId) -> Option<Arc<Session>> {
        self.by_participant
            .get(&participant)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_by_id(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let participant = *self.by_session.get(&session_id)?.value();
        self.session(participant)
            .filter(|session| session.session_id() == session_id)
    }

    /// 本实例上属于该会话的全部在线会话
    pub fn sessions_for(&self, conversation: ConversationId) -> Vec<Arc<Session>> {
        let participants: Vec<ParticipantId> = match self.by_conversation.get(&conversation) {
            Some(entry) => entry.iter().copied().collect(),
            None => return Vec::new(),
        };
        participants
            .into_iter()
            .filter_map(|participant| self.session(participant))
            .collect()
    }

    /// 在线期间加入新会话；返回该会话是否因此在本实例上变为活跃
    pub fn link(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
    ) -> Result<bool, RegistryError> {
        let session = self
            .session(participant)
            .ok_or(RegistryError::SessionNotFound(participant))?;
        session.join(conversation);
        Ok(self.index(participant, conversation))
    }

    /// 在线期间被移出会话；返回该会话是否因此在本实例上变为不活跃
    pub fn unlink(
        &self,
        participant: ParticipantId,
        conversation: ConversationId,
    ) -> Result<bool, RegistryError> {
        let session = self
            .session(participant)
            .ok_or(RegistryError::SessionNotFound(participant))?;
        if !session.leave(conversation) {
            return Ok(false);
        }
        Ok(self.drop_member(participant, conversation))
    }

    pub fn has_local(&self, conversation: ConversationId) -> bool {
        self.by_conversation.contains_key(&conversation)
    }

    pub fn len(&self) -> usize {
        self.by_participant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_participant.is_empty()
    }

    /// 返回该会话是否是第一个本地成员
    fn index(&self, participant: ParticipantId, conversation: ConversationId) -> bool {
        let mut members = self.by_conversation.entry(conversation).or_default();
        let was_empty = members.is_empty();
        members.insert(participant);
        was_empty
    }

    fn unindex(&self, session: Arc<Session>) -> (Arc<Session>, Vec<ConversationId>) {
        let participant = session.participant_id();
        self.by_session.remove(&session.session_id());

        let deactivated = session
            .conversations()
            .into_iter()
            .filter(|conversation| self.drop_member(participant, *conversation))
            .collect();
        (session, deactivated)
    }

    /// 返回该会话是否因此没有本地成员
    fn drop_member(&self, participant: ParticipantId, conversation: ConversationId) -> bool {
        if let Some(mut members) = self.by_conversation.get_mut(&conversation) {
            members.remove(&participant);
        }
        self.by_conversation
            .remove_if(&conversation, |_, members| members.is_empty())
            .is_some()
    }
}
