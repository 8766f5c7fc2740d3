//! 领域模型错误定义
//!
//! 定义了领域层与存储适配器共享的错误类型。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 会话相关错误
    #[error("会话错误: {message}")]
    ConversationError { message: String },

    /// 消息相关错误
    #[error("消息错误: {message}")]
    MessageError { message: String },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },
}

impl DomainError {
    /// 创建会话错误
    pub fn conversation_error(message: impl Into<String>) -> Self {
        Self::ConversationError {
            message: message.into(),
        }
    }

    /// 创建消息错误
    pub fn message_error(message: impl Into<String>) -> Self {
        Self::MessageError {
            message: message.into(),
        }
    }

    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 持久化存储错误（消息日志、会话目录、回执）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// 存储不可用（连接失败、查询失败）
    #[error("存储不可用: {message}")]
    Unavailable { message: String },

    /// 操作超时
    #[error("存储操作超时: {operation}")]
    Timeout { operation: String },

    /// 存储中的数据无法还原为领域对象
    #[error("存储数据损坏: {message}")]
    Corrupt { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
