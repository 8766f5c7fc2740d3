use sqlx::migrate::Migrator;

/// 消息日志、会话目录、回执表的迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
