//! 聊天消息投递管线的核心领域模型
//!
//! 包含会话、消息、序列号、送达回执等核心实体，以及相关的校验规则。

pub mod conversation;
pub mod errors;
pub mod message;
pub mod receipt;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use message::*;
pub use receipt::*;
pub use value_objects::*;
