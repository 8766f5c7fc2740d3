use domain::{ConversationId, DomainError, ParticipantId, SequenceNumber, SessionId, StoreError};
use thiserror::Error;

/// 同步校验失败，调用方修正输入后才能重试。
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),
    #[error("participant {sender} is not a member of conversation {conversation}")]
    InvalidSender {
        sender: ParticipantId,
        conversation: ConversationId,
    },
}

/// 接入管线错误
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// 持久化失败，消息没有写入也不会发布，可以安全重试
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
}

impl IngestError {
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailed(message.into())
    }
}

/// 序列号分配与条件追加失败
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("conversation {conversation} still contended after {attempts} attempts")]
    Contended {
        conversation: ConversationId,
        attempts: u32,
    },
    #[error("sequence lease unavailable: {0}")]
    LeaseUnavailable(String),
}

/// 广播总线错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("bus codec error: {0}")]
    Codec(String),
}

impl BusError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }
}

/// 连接注册表错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("participant {0} already has a session on this instance")]
    DuplicateSession(ParticipantId),
    #[error("no session for participant {0}")]
    SessionNotFound(ParticipantId),
}

/// 网关对传输层暴露的错误
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("session is not subscribed to conversation {0}")]
    NotMember(ConversationId),
    #[error("history limit must be within 1..=1000, got {0}")]
    InvalidLimit(usize),
    #[error("page size must be within 1..=100, got {0}")]
    InvalidPageSize(usize),
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),
    #[error("message {sequence} not found in conversation {conversation}")]
    MessageNotFound {
        conversation: ConversationId,
        sequence: SequenceNumber,
    },
    #[error("acknowledged {sequence} in conversation {conversation} but only {delivered} was delivered")]
    AckAheadOfDelivery {
        conversation: ConversationId,
        sequence: SequenceNumber,
        delivered: SequenceNumber,
    },
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
}
