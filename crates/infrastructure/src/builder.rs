use std::sync::Arc;
use std::time::Duration;

use application::{
    BroadcastBus, ConversationDirectory, GatewayDependencies, InMemoryReceiptStore, LeasedSequencer,
    LogStore, OptimisticSequencer, ReceiptStore, Sequencer, SystemClock,
};
use config::{AppConfig, SequencerStrategy};
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::info;

use crate::{
    migrations::MIGRATOR,
    redis::{CachedConversationDirectory, RedisBroadcastBus, RedisError, RedisLeaseSequencer},
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
}

/// 生产环境适配器：PostgreSQL 日志与目录、Redis 总线与缓存
#[derive(Clone)]
pub struct Infrastructure {
    pub storage: PgStorage,
    pub bus: Arc<RedisBroadcastBus>,
    pub directory: Arc<CachedConversationDirectory>,
    redis: ConnectionManager,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        info!("数据库迁移完成");

        let storage = PgStorage::new(pool, config.database.operation_timeout());
        let bus = Arc::new(RedisBroadcastBus::connect(&config.redis).await?);

        let client = redis::Client::open(config.redis.url.as_str()).map_err(RedisError::from)?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(RedisError::from)?;
        let directory = Arc::new(CachedConversationDirectory::new(
            storage.directory.clone(),
            redis.clone(),
            Duration::from_secs(config.redis.conversation_cache_ttl_seconds),
        ));

        Ok(Self {
            storage,
            bus,
            directory,
            redis,
        })
    }

    /// 按配置组装网关依赖
    pub fn gateway_dependencies(&self, config: &AppConfig) -> GatewayDependencies {
        let log: Arc<dyn LogStore> = self.storage.log_store.clone();
        let receipts: Arc<dyn ReceiptStore> = if config.database.persist_receipts {
            self.storage.receipts.clone()
        } else {
            Arc::new(InMemoryReceiptStore::new())
        };
        let sequencer: Arc<dyn Sequencer> = match config.pipeline.sequencer {
            SequencerStrategy::RedisLease => Arc::new(RedisLeaseSequencer::new(
                self.redis.clone(),
                log.clone(),
                &config.redis,
                config.pipeline.sequence_conflict_retries,
            )),
            strategy => local_sequencer(strategy, log.clone(), config),
        };
        let bus: Arc<dyn BroadcastBus> = self.bus.clone();
        let directory: Arc<dyn ConversationDirectory> = self.directory.clone();

        GatewayDependencies {
            log,
            bus,
            directory,
            receipts,
            sequencer,
            clock: Arc::new(SystemClock),
        }
    }
}

/// 不依赖 Redis 的序列号分配器；`RedisLease` 在这里退化为乐观分配
pub fn local_sequencer(
    strategy: SequencerStrategy,
    log: Arc<dyn LogStore>,
    config: &AppConfig,
) -> Arc<dyn Sequencer> {
    let retries = config.pipeline.sequence_conflict_retries;
    match strategy {
        SequencerStrategy::Leased => Arc::new(LeasedSequencer::new(log, retries)),
        SequencerStrategy::Optimistic | SequencerStrategy::RedisLease => {
            Arc::new(OptimisticSequencer::new(log, retries))
        }
    }
}
