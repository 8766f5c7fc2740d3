//! 集成测试共用的装配与断言辅助
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::{
    BroadcastBus, DeliveryStream, Gateway, GatewayDependencies, InMemoryConversationDirectory,
    InMemoryLogStore, InMemoryReceiptStore, LeasedSequencer, LocalBroadcastBus, LogStore,
    SupervisorState, SystemClock,
};
use config::AppConfig;

pub const WAIT: Duration = Duration::from_secs(3);

/// 一组共享的存储与总线；多个网关实例可以共用同一组
#[derive(Clone)]
pub struct SharedBackends {
    pub log: Arc<dyn LogStore>,
    pub memory_log: Arc<InMemoryLogStore>,
    pub bus: Arc<dyn BroadcastBus>,
    pub directory: Arc<InMemoryConversationDirectory>,
    pub receipts: Arc<InMemoryReceiptStore>,
}

impl SharedBackends {
    pub fn in_memory() -> Self {
        let memory_log = Arc::new(InMemoryLogStore::new());
        Self {
            log: memory_log.clone(),
            memory_log,
            bus: Arc::new(LocalBroadcastBus::new(1024)),
            directory: Arc::new(InMemoryConversationDirectory::new()),
            receipts: Arc::new(InMemoryReceiptStore::new()),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn LogStore>) -> Self {
        self.log = log;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn BroadcastBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn gateway(&self, config: &AppConfig) -> Gateway {
        Gateway::start(
            GatewayDependencies {
                log: self.log.clone(),
                bus: self.bus.clone(),
                directory: self.directory.clone(),
                receipts: self.receipts.clone(),
                sequencer: Arc::new(LeasedSequencer::new(self.log.clone(), 64)),
                clock: Arc::new(SystemClock),
            },
            config,
        )
    }
}

/// 测试用配置：缩短所有重试间隔
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::from_env_with_defaults();
    config.pipeline.publish_base_delay_ms = 1;
    config.pipeline.publish_max_delay_ms = 5;
    config.delivery.replay_retry_delay_ms = 5;
    config
}

/// 按顺序收到且只收到这些序列号
pub async fn expect_sequences(stream: &mut DeliveryStream, expected: impl IntoIterator<Item = u64>) {
    for sequence in expected {
        let message = tokio::time::timeout(WAIT, stream.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for sequence {sequence}"))
            .expect("delivery stream closed");
        assert_eq!(message.sequence.value(), sequence);
    }
}

/// 在给定时间内没有任何投递
pub async fn assert_quiet(stream: &mut DeliveryStream, window: Duration) {
    if let Ok(Some(message)) = tokio::time::timeout(window, stream.recv()).await {
        panic!("unexpected delivery of sequence {}", message.sequence);
    }
}

pub async fn wait_state(stream: &DeliveryStream, wanted: SupervisorState) {
    let mut state = stream.state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == wanted))
        .await
        .expect("timed out waiting for supervisor state")
        .expect("supervisor state channel closed");
}

/// 等待条件成立（轮询）
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
