//! Redis 适配器
//!
//! Pub/Sub 广播总线、会话元数据缓存和跨实例的序列号租约。

pub mod bus;
pub mod cached_directory;
pub mod error;
pub mod lease_sequencer;

pub use bus::RedisBroadcastBus;
pub use cached_directory::CachedConversationDirectory;
pub use error::{RedisError, RedisResult};
pub use lease_sequencer::RedisLeaseSequencer;
