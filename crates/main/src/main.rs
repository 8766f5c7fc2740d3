//! 主应用程序入口
//!
//! 按配置装配存储后端与序列号策略，启动消息投递网关。
//! 传输层（WebSocket 等）在网关之外接入。

use std::sync::Arc;
use std::time::Duration;

use application::{
    Gateway, GatewayDependencies, InMemoryConversationDirectory, InMemoryLogStore,
    InMemoryReceiptStore, LocalBroadcastBus, LogStore, SystemClock,
};
use config::{AppConfig, StorageBackend};
use infrastructure::{local_sequencer, Infrastructure};
use tracing::info;
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    info!(
        instance = %config.server.instance_name,
        backend = ?config.backend,
        sequencer = ?config.pipeline.sequencer,
        "配置加载完成"
    );

    let deps = match config.backend {
        StorageBackend::Memory => memory_dependencies(&config),
        StorageBackend::Postgres => {
            let infrastructure = Infrastructure::connect(&config).await?;
            infrastructure.gateway_dependencies(&config)
        }
    };

    let gateway = Gateway::start(deps, &config);
    info!(instance = %config.server.instance_name, "消息投递网关已启动");

    let reporter = gateway.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            info!(
                online_sessions = reporter.online_sessions(),
                dispatcher = ?reporter.dispatcher_stats(),
                publisher = ?reporter.publisher_stats(),
                "网关运行统计"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始关闭");
    stats_task.abort();
    gateway.shutdown().await;

    Ok(())
}

/// 单实例内存后端，用于开发环境
fn memory_dependencies(config: &AppConfig) -> GatewayDependencies {
    let log: Arc<dyn LogStore> = Arc::new(InMemoryLogStore::new());
    GatewayDependencies {
        sequencer: local_sequencer(config.pipeline.sequencer, log.clone(), config),
        log,
        bus: Arc::new(LocalBroadcastBus::new(config.pipeline.publish_queue_capacity)),
        directory: Arc::new(InMemoryConversationDirectory::new()),
        receipts: Arc::new(InMemoryReceiptStore::new()),
        clock: Arc::new(SystemClock),
    }
}
