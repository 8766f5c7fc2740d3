use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, ParticipantId, SequenceNumber, Timestamp, TraceContext};

/// 尚未分配序列号的消息草稿
///
/// 接入管线校验通过后生成，由序列号分配器补上序列号并持久化。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub payload: Vec<u8>,
    pub created_at: Timestamp,
    pub trace: TraceContext,
}

impl MessageDraft {
    pub fn new(
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        payload: Vec<u8>,
        created_at: Timestamp,
        trace: TraceContext,
    ) -> Result<Self, DomainError> {
        if payload.is_empty() {
            return Err(DomainError::validation_error("payload", "cannot be empty"));
        }
        Ok(Self {
            conversation_id,
            sender_id,
            payload,
            created_at,
            trace,
        })
    }

    /// 绑定序列号，得到不可变的消息
    pub fn sequenced(&self, sequence: SequenceNumber) -> Message {
        Message {
            conversation_id: self.conversation_id,
            sequence,
            sender_id: self.sender_id,
            payload: self.payload.clone(),
            created_at: self.created_at,
            trace: self.trace.clone(),
        }
    }
}

/// 已分配序列号的消息，持久化后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: ConversationId,
    pub sequence: SequenceNumber,
    pub sender_id: ParticipantId,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(default)]
    pub trace: TraceContext,
}

impl Message {
    /// 序列化为总线传输用的 JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 负载以 base64 文本形式出现在 JSON 中
mod payload_base64 {
    use data_encoding::BASE64;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(payload))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}
