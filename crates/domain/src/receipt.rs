use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, ParticipantId, SequenceNumber, SessionId};

/// 客户端送达确认
///
/// 只用于推进投递监督器的重放游标；是否持久化取决于回执存储的实现。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub conversation_id: ConversationId,
    pub sequence: SequenceNumber,
}

impl DeliveryReceipt {
    pub fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        conversation_id: ConversationId,
        sequence: SequenceNumber,
    ) -> Self {
        Self {
            session_id,
            participant_id,
            conversation_id,
            sequence,
        }
    }

    /// 回执只能前进：较旧的确认不会覆盖较新的确认
    pub fn advances(&self, current: SequenceNumber) -> bool {
        self.sequence > current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_only_advances_forward() {
        let receipt = DeliveryReceipt::new(
            SessionId::random(),
            ParticipantId::random(),
            ConversationId::random(),
            SequenceNumber::new(5),
        );

        assert!(receipt.advances(SequenceNumber::new(4)));
        assert!(!receipt.advances(SequenceNumber::new(5)));
        assert!(!receipt.advances(SequenceNumber::new(9)));
    }
}
