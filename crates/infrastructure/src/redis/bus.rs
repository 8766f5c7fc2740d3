//! 基于 Redis Pub/Sub 的跨实例广播总线
//!
//! 每个会话一个频道 `{prefix}{conversation_id}`，负载是消息的 JSON。
//! Pub/Sub 不保证送达：订阅建立之前或连接断开期间的消息会丢失，由日志重放补齐。

use application::{BroadcastBus, BusError, MessageStream};
use async_trait::async_trait;
use config::RedisConfig;
use domain::{ConversationId, Message};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use super::error::{RedisError, RedisResult};

pub struct RedisBroadcastBus {
    client: Client,
    publisher: ConnectionManager,
    channel_prefix: String,
}

impl RedisBroadcastBus {
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        info!(channel_prefix = %config.channel_prefix, "Redis 广播总线已连接");

        Ok(Self {
            client,
            publisher,
            channel_prefix: config.channel_prefix.clone(),
        })
    }

    pub fn channel(&self, conversation: ConversationId) -> String {
        format!("{}{}", self.channel_prefix, conversation)
    }
}

#[async_trait]
impl BroadcastBus for RedisBroadcastBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        let channel = self.channel(message.conversation_id);
        let payload = message.to_json().map_err(RedisError::from)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(RedisError::from)?;
        debug!(
            channel = %channel,
            sequence = %message.sequence,
            receivers,
            "消息已发布"
        );
        Ok(())
    }

    // TODO: 同一实例的全部订阅共用一条 PubSub 连接，按频道分流
    async fn subscribe(&self, conversation: ConversationId) -> Result<MessageStream, BusError> {
        let channel = self.channel(conversation);
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(RedisError::from)?;
        pubsub.subscribe(&channel).await.map_err(RedisError::from)?;
        debug!(channel = %channel, "已订阅会话频道");

        let stream = pubsub.into_on_message().filter_map(move |msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(channel = %msg.get_channel_name(), error = %err, "频道负载不是文本");
                    return None;
                }
            };
            match Message::from_json(&payload) {
                Ok(message) if message.conversation_id == conversation => Some(message),
                Ok(message) => {
                    warn!(
                        expected = %conversation,
                        actual = %message.conversation_id,
                        "频道中出现其他会话的消息"
                    );
                    None
                }
                Err(err) => {
                    warn!(channel = %msg.get_channel_name(), error = %err, "无法解析频道消息");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
