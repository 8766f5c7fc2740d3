use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, ParticipantId, Timestamp};

/// 会话类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    /// 群组会话
    Group {
        title: String,
        description: Option<String>,
    },
    /// 两人私聊
    Direct,
}

/// 会话：一组共享有序消息日志的参与者。
///
/// 序列号计数器不在这里，由消息日志在首条消息写入时隐式创建。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    participants: Vec<ParticipantId>,
    /// 群组管理员，必须是成员；私聊没有管理员
    pub admin: Option<ParticipantId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

/// 群组的整体更新：标题、描述、管理员和成员列表一并替换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub title: String,
    pub description: Option<String>,
    pub admin: ParticipantId,
    pub participants: Vec<ParticipantId>,
}

/// 一次更新带来的成员变化
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<ParticipantId>,
    pub removed: Vec<ParticipantId>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl Conversation {
    pub fn new_group(
        id: ConversationId,
        title: impl Into<String>,
        description: Option<String>,
        participants: Vec<ParticipantId>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let title = normalize_title(title.into())?;
        let participants = normalize(participants)?;
        // 创建者（列表中的第一位）默认为管理员
        let admin = participants.first().copied();
        Ok(Self {
            id,
            kind: ConversationKind::Group { title, description },
            participants,
            admin,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn new_direct(
        id: ConversationId,
        from: ParticipantId,
        to: ParticipantId,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        if from == to {
            return Err(DomainError::validation_error(
                "participants",
                "direct conversation needs two distinct participants",
            ));
        }
        Ok(Self {
            id,
            kind: ConversationKind::Direct,
            participants: vec![from, to],
            admin: None,
            created_at,
            updated_at: created_at,
        })
    }

    /// 从存储记录还原，重新执行参与者校验
    pub fn restore(
        id: ConversationId,
        kind: ConversationKind,
        participants: Vec<ParticipantId>,
        admin: Option<ParticipantId>,
        created_at: Timestamp,
        updated_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let participants = normalize(participants)?;
        if kind == ConversationKind::Direct && participants.len() != 2 {
            return Err(DomainError::conversation_error(
                "direct conversation must have exactly two participants",
            ));
        }
        if let Some(admin) = admin {
            if !participants.contains(&admin) {
                return Err(DomainError::conversation_error("admin is not a member"));
            }
        }
        Ok(Self {
            id,
            kind,
            participants,
            admin,
            created_at,
            updated_at,
        })
    }

    /// 替换群组的元数据与成员，返回成员变化。私聊不能更新。
    pub fn update(
        &mut self,
        update: ConversationUpdate,
        now: Timestamp,
    ) -> Result<MembershipChange, DomainError> {
        if self.kind == ConversationKind::Direct {
            return Err(DomainError::conversation_error(
                "direct conversation cannot be updated",
            ));
        }
        let title = normalize_title(update.title)?;
        let participants = normalize(update.participants)?;
        if !participants.contains(&update.admin) {
            return Err(DomainError::validation_error("admin", "must be a member"));
        }

        let change = MembershipChange {
            added: participants
                .iter()
                .filter(|p| !self.participants.contains(p))
                .copied()
                .collect(),
            removed: self
                .participants
                .iter()
                .filter(|p| !participants.contains(p))
                .copied()
                .collect(),
        };

        self.kind = ConversationKind::Group {
            title,
            description: update.description,
        };
        self.participants = participants;
        self.admin = Some(update.admin);
        self.updated_at = now;
        Ok(change)
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn is_participant(&self, participant: ParticipantId) -> bool {
        self.participants.contains(&participant)
    }
}

fn normalize_title(title: String) -> Result<String, DomainError> {
    let title = title.trim().to_owned();
    if title.is_empty() {
        return Err(DomainError::validation_error("title", "cannot be empty"));
    }
    if title.chars().count() > 100 {
        return Err(DomainError::validation_error("title", "too long"));
    }
    Ok(title)
}

/// 去重并保持首次出现的顺序
fn normalize(participants: Vec<ParticipantId>) -> Result<Vec<ParticipantId>, DomainError> {
    let mut ordered = Vec::with_capacity(participants.len());
    for participant in participants {
        if !ordered.contains(&participant) {
            ordered.push(participant);
        }
    }
    if ordered.is_empty() {
        return Err(DomainError::validation_error(
            "participants",
            "cannot be empty",
        ));
    }
    Ok(ordered)
}
