//! 广播总线
//!
//! 跨网关实例的实时扇出通道。语义为至多一次、单个发布者在同一主题内有序；
//! 消息丢失由投递监督器从日志重放补齐。

use std::pin::Pin;

use async_trait::async_trait;
use domain::{ConversationId, Message};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::debug;

use crate::error::BusError;

/// 某个会话主题上的消息流
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

#[async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn publish(&self, message: &Message) -> Result<(), BusError>;

    /// 订阅会话主题，返回时订阅已经生效
    async fn subscribe(&self, conversation: ConversationId) -> Result<MessageStream, BusError>;
}

/// 进程内广播总线（单实例部署与测试）
#[derive(Clone)]
pub struct LocalBroadcastBus {
    sender: broadcast::Sender<Message>,
}

impl LocalBroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LocalBroadcastBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl BroadcastBus for LocalBroadcastBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        // 没有订阅者时 send 返回错误，这对至多一次的总线不算失败
        if self.sender.send(message.clone()).is_err() {
            debug!(
                conversation_id = %message.conversation_id,
                sequence = message.sequence.value(),
                "本地总线没有订阅者"
            );
        }
        Ok(())
    }

    async fn subscribe(&self, conversation: ConversationId) -> Result<MessageStream, BusError> {
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let message = match item {
                // 只保留属于当前会话的消息
                Ok(message) if message.conversation_id == conversation => Some(message),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(conversation_id = %conversation, skipped, "本地总线订阅者落后，消息已丢弃");
                    None
                }
            };
            futures::future::ready(message)
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{MessageDraft, ParticipantId, SequenceNumber, TraceContext};
    use time::OffsetDateTime;

    fn message(conversation: ConversationId, sequence: u64) -> Message {
        MessageDraft::new(
            conversation,
            ParticipantId::random(),
            b"hello".to_vec(),
            OffsetDateTime::now_utc(),
            TraceContext::empty(),
        )
        .unwrap()
        .sequenced(SequenceNumber::new(sequence))
    }

    #[tokio::test]
    async fn subscription_only_sees_its_conversation() {
        let bus = LocalBroadcastBus::new(16);
        let conversation = ConversationId::random();
        let mut stream = bus.subscribe(conversation).await.unwrap();

        bus.publish(&message(ConversationId::random(), 1)).await.unwrap();
        bus.publish(&message(conversation, 1)).await.unwrap();
        bus.publish(&message(conversation, 2)).await.unwrap();

        assert_eq!(stream.next().await.unwrap().sequence.value(), 1);
        assert_eq!(stream.next().await.unwrap().sequence.value(), 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = LocalBroadcastBus::default();
        assert!(bus.publish(&message(ConversationId::random(), 1)).await.is_ok());
    }
}
