//! PostgreSQL 连接池与存储适配器的公共部分

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use domain::{SequenceNumber, StoreError, StoreResult};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::directory::PgConversationDirectory;
use crate::log_store::PgLogStore;
use crate::receipts::PgReceiptStore;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::timeout("acquire connection"),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::corrupt(err.to_string())
        }
        other => StoreError::unavailable(other.to_string()),
    }
}

pub(crate) fn invalid_data(message: impl Into<String>) -> StoreError {
    StoreError::corrupt(message)
}

/// 给一次数据库操作加上超时，超时后结果未知
pub(crate) async fn timed<T, F>(operation: &'static str, limit: Duration, query: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, query).await {
        Ok(result) => result.map_err(map_sqlx_err),
        Err(_) => Err(StoreError::timeout(operation)),
    }
}

pub(crate) fn sequence_to_db(sequence: SequenceNumber) -> StoreResult<i64> {
    i64::try_from(sequence.value())
        .map_err(|_| StoreError::corrupt(format!("sequence {sequence} out of range")))
}

pub(crate) fn sequence_from_db(value: i64) -> StoreResult<SequenceNumber> {
    u64::try_from(value)
        .map(SequenceNumber::new)
        .map_err(|_| invalid_data(format!("negative sequence {value}")))
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// 共用同一个连接池的全部 PostgreSQL 适配器
#[derive(Clone)]
pub struct PgStorage {
    pub log_store: Arc<PgLogStore>,
    pub directory: Arc<PgConversationDirectory>,
    pub receipts: Arc<PgReceiptStore>,
}

impl PgStorage {
    pub fn new(pool: PgPool, operation_timeout: Duration) -> Self {
        Self {
            log_store: Arc::new(PgLogStore::new(pool.clone(), operation_timeout)),
            directory: Arc::new(PgConversationDirectory::new(pool.clone(), operation_timeout)),
            receipts: Arc::new(PgReceiptStore::new(pool, operation_timeout)),
        }
    }
}
