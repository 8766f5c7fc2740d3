//! 故障注入：存储写入失败、总线丢失全部消息、总线不可达

mod support;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use application::{
    AppendOutcome, BroadcastBus, BusError, GatewayError, IngestError, InMemoryLogStore,
    LocalBroadcastBus, LogStore, MessageStream,
};
use async_trait::async_trait;
use domain::{
    ConversationId, ConversationKind, Message, ParticipantId, SequenceNumber, StoreError,
    StoreResult, TraceContext,
};
use support::{eventually, expect_sequences, fast_config, wait_state, SharedBackends};

/// 可以切换为写入失败的日志
struct FlakyLog {
    inner: InMemoryLogStore,
    fail_appends: AtomicBool,
}

impl FlakyLog {
    fn new() -> Self {
        Self {
            inner: InMemoryLogStore::new(),
            fail_appends: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail_appends.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogStore for FlakyLog {
    async fn append(&self, message: &Message) -> StoreResult<AppendOutcome> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("write quorum lost"));
        }
        self.inner.append(message).await
    }

    async fn read(
        &self,
        conversation: ConversationId,
        from: SequenceNumber,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        self.inner.read(conversation, from, limit).await
    }

    async fn head(&self, conversation: ConversationId) -> StoreResult<SequenceNumber> {
        self.inner.head(conversation).await
    }

    async fn recent(&self, conversation: ConversationId, limit: usize) -> StoreResult<Vec<Message>> {
        self.inner.recent(conversation, limit).await
    }

    async fn get(
        &self,
        conversation: ConversationId,
        sequence: SequenceNumber,
    ) -> StoreResult<Option<Message>> {
        self.inner.get(conversation, sequence).await
    }
}

/// 记录发布次数的总线
struct CountingBus {
    inner: LocalBroadcastBus,
    published: AtomicU64,
}

#[async_trait]
impl BroadcastBus for CountingBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(message).await
    }

    async fn subscribe(&self, conversation: ConversationId) -> Result<MessageStream, BusError> {
        self.inner.subscribe(conversation).await
    }
}

/// 发布总是"成功"但消息全部丢失，订阅永远收不到消息
struct BlackholeBus;

#[async_trait]
impl BroadcastBus for BlackholeBus {
    async fn publish(&self, _: &Message) -> Result<(), BusError> {
        Ok(())
    }

    async fn subscribe(&self, _: ConversationId) -> Result<MessageStream, BusError> {
        Ok(Box::pin(futures::stream::pending()))
    }
}

/// 订阅总是失败的总线
struct UnreachableBus;

#[async_trait]
impl BroadcastBus for UnreachableBus {
    async fn publish(&self, _: &Message) -> Result<(), BusError> {
        Err(BusError::unavailable("connection refused"))
    }

    async fn subscribe(&self, _: ConversationId) -> Result<MessageStream, BusError> {
        Err(BusError::unavailable("connection refused"))
    }
}

fn group() -> ConversationKind {
    ConversationKind::Group {
        title: "faults".to_string(),
        description: Some("fault injection".to_string()),
    }
}

#[tokio::test]
async fn failed_append_is_never_published() {
    let log = Arc::new(FlakyLog::new());
    let bus = Arc::new(CountingBus {
        inner: LocalBroadcastBus::new(64),
        published: AtomicU64::new(0),
    });
    let backends = SharedBackends::in_memory()
        .with_log(log.clone())
        .with_bus(bus.clone());
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group(), vec![alice, ParticipantId::random()])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();

    log.set_failing(true);
    let result = gateway
        .submit(a.session_id(), conversation.id, b"lost".to_vec(), TraceContext::empty())
        .await;
    assert!(matches!(
        result,
        Err(GatewayError::Ingest(IngestError::PersistenceFailed(_)))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bus.published.load(Ordering::SeqCst), 0);

    // 失败的写入没有推进序列号
    log.set_failing(false);
    let sequence = gateway
        .submit(a.session_id(), conversation.id, b"kept".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    assert_eq!(sequence, SequenceNumber::new(1));
    eventually(|| bus.published.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn blackholed_bus_still_delivers_through_replay() {
    let backends = SharedBackends::in_memory().with_bus(Arc::new(BlackholeBus));
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group(), vec![alice, bob])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();
    let b = gateway.attach(bob).await.unwrap();
    wait_state(&b, application::SupervisorState::Live).await;

    for i in 1..=3u8 {
        gateway
            .submit(a.session_id(), conversation.id, vec![i], TraceContext::empty())
            .await
            .unwrap();
    }

    // 重连触发追赶，全部消息从日志补齐
    gateway.detach(b.session_id()).await;
    let mut b = gateway.attach(bob).await.unwrap();
    expect_sequences(&mut b, 1..=3).await;

    // 新建私聊后再次重连，两个会话都从日志补齐
    let direct = gateway
        .open_conversation(ConversationKind::Direct, vec![alice, bob])
        .await
        .unwrap();
    let sequence = gateway
        .submit(a.session_id(), direct.id, b"dm".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    gateway.detach(b.session_id()).await;
    let mut b = gateway.attach(bob).await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..4 {
        let message = tokio::time::timeout(support::WAIT, b.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push((message.conversation_id, message.sequence));
    }
    assert!(seen.contains(&(direct.id, sequence)));
    assert_eq!(seen.iter().filter(|(c, _)| *c == conversation.id).count(), 3);
}

#[tokio::test]
async fn unreachable_bus_does_not_block_submit_or_replay() {
    let backends = SharedBackends::in_memory().with_bus(Arc::new(UnreachableBus));
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group(), vec![alice, bob])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();

    for i in 1..=2u8 {
        gateway
            .submit(a.session_id(), conversation.id, vec![i], TraceContext::empty())
            .await
            .unwrap();
    }
    eventually(|| gateway.publisher_stats().exhausted == 2).await;

    let mut b = gateway.attach(bob).await.unwrap();
    expect_sequences(&mut b, 1..=2).await;
    assert_eq!(gateway.dispatcher_stats().subscriptions, 0);
}
