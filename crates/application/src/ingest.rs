//! 消息接入管线：校验 → 分配序列号并持久化 → 异步发布

use std::sync::Arc;

use domain::{ConversationId, Message, MessageDraft, ParticipantId, TraceContext};
use tracing::{debug, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::directory::ConversationDirectory;
use crate::error::{IngestError, ValidationError};
use crate::publisher::Publisher;
use crate::sequencer::Sequencer;

/// 一条待接入的消息
#[derive(Debug, Clone)]
pub struct IngestCommand {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub payload: Vec<u8>,
    pub trace: TraceContext,
}

pub struct IngestPipeline {
    directory: Arc<dyn ConversationDirectory>,
    sequencer: Arc<dyn Sequencer>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    max_payload_bytes: usize,
}

impl IngestPipeline {
    pub fn new(
        directory: Arc<dyn ConversationDirectory>,
        sequencer: Arc<dyn Sequencer>,
        publisher: Publisher,
        clock: Arc<dyn Clock>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            directory,
            sequencer,
            publisher,
            clock,
            max_payload_bytes,
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// 接入一条消息，返回持久化后的消息。
    ///
    /// 返回 `Ok` 时消息已经写入日志；发布是异步的，发布失败不影响返回值。
    /// 返回 `PersistenceFailed` 时消息既没有写入也没有发布。
    pub async fn ingest(&self, command: IngestCommand) -> Result<Message, IngestError> {
        let span = info_span!(
            "ingest",
            conversation_id = %command.conversation_id,
            sender_id = %command.sender_id,
            trace = %command.trace,
            sequence = tracing::field::Empty,
        );
        self.ingest_inner(command).instrument(span).await
    }

    async fn ingest_inner(&self, command: IngestCommand) -> Result<Message, IngestError> {
        self.validate(&command).await?;

        let draft = MessageDraft::new(
            command.conversation_id,
            command.sender_id,
            command.payload,
            self.clock.now(),
            command.trace,
        )
        .map_err(|_| ValidationError::EmptyPayload)?;

        // 先写日志再发布：只有持久化成功的消息才会进入发布队列。
        // 入队发生在会话写锁内，同一会话的消息按序列号顺序进入发布分片。
        let publisher = &self.publisher;
        let enqueue = |message: &Message| {
            if !publisher.enqueue(message.clone()) {
                debug!(sequence = message.sequence.value(), "未进入发布队列");
            }
        };
        let message = self
            .sequencer
            .append_next_with(draft, &enqueue)
            .await
            .map_err(|err| {
                warn!(error = %err, "消息持久化失败");
                IngestError::persistence(err.to_string())
            })?;
        tracing::Span::current().record("sequence", message.sequence.value());
        Ok(message)
    }

    async fn validate(&self, command: &IngestCommand) -> Result<(), IngestError> {
        if command.payload.is_empty() {
            return Err(ValidationError::EmptyPayload.into());
        }
        if command.payload.len() > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size: command.payload.len(),
                limit: self.max_payload_bytes,
            }
            .into());
        }

        let conversation = self
            .directory
            .find(command.conversation_id)
            .await
            .map_err(|err| {
                warn!(error = %err, "会话目录查询失败");
                IngestError::persistence(err.to_string())
            })?
            .ok_or(ValidationError::UnknownConversation(command.conversation_id))?;

        if !conversation.is_participant(command.sender_id) {
            return Err(ValidationError::InvalidSender {
                sender: command.sender_id,
                conversation: command.conversation_id,
            }
            .into());
        }
        Ok(())
    }
}
