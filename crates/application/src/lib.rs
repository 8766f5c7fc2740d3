//! 应用层实现。
//!
//! 消息扇出与投递管线：接入（校验、分配序列号、持久化、异步发布），
//! 扇出分发（总线订阅 → 分片工作者 → 会话投递通道），
//! 以及每个连接会话一个的投递监督器（日志重放 + 实时投递）。
//!
//! 外部依赖（消息日志、广播总线、会话目录、回执存储）都以 trait 抽象，
//! 这里附带内存实现，生产实现在 `infrastructure` 中。

pub mod bus;
pub mod clock;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod log_store;
pub mod publisher;
pub mod receipts;
pub mod registry;
pub mod retry;
pub mod sequencer;
pub mod supervisor;

pub use bus::{BroadcastBus, LocalBroadcastBus, MessageStream};
pub use clock::{Clock, SystemClock};
pub use directory::{ConversationDirectory, InMemoryConversationDirectory};
pub use dispatcher::{Dispatcher, DispatcherStats, DispatcherStatsSnapshot};
pub use error::{
    BusError, GatewayError, IngestError, RegistryError, SequenceError, ValidationError,
};
pub use gateway::{DeliveryStream, Gateway, GatewayDependencies};
pub use ingest::{IngestCommand, IngestPipeline};
pub use log_store::{AppendOutcome, InMemoryLogStore, LogStore};
pub use publisher::{PublishRetryPolicy, Publisher, PublisherStatsSnapshot};
pub use receipts::{InMemoryReceiptStore, ReceiptStore};
pub use registry::{ConnectionRegistry, OfferOutcome, Session};
pub use retry::{retry_async, Backoff, RetryPolicy};
pub use sequencer::{LeasedSequencer, OnCommit, OptimisticSequencer, Sequencer};
pub use supervisor::{DeliverySupervisor, SupervisorSettings, SupervisorState};
