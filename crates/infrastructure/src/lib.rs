//! 基础设施层实现。
//!
//! 提供 PostgreSQL 消息日志、会话目录、回执存储，以及 Redis 广播总线、
//! 会话缓存和序列号租约，实现应用层定义的接口。

pub mod builder;
pub mod directory;
pub mod log_store;
pub mod migrations;
pub mod receipts;
pub mod redis;
pub mod repository;

pub use builder::{local_sequencer, Infrastructure, InfrastructureError};
pub use directory::PgConversationDirectory;
pub use log_store::PgLogStore;
pub use migrations::MIGRATOR;
pub use receipts::PgReceiptStore;
pub use crate::redis::{CachedConversationDirectory, RedisBroadcastBus, RedisLeaseSequencer};
pub use repository::{create_pg_pool, PgStorage};
