//! 端到端投递场景：实时投递、断线重连重放、并发提交、多实例扇出、背压

mod support;

use std::collections::BTreeSet;
use std::time::Duration;

use application::{
    BroadcastBus, GatewayError, IngestError, LogStore, ReceiptStore, SupervisorState,
    ValidationError,
};
use domain::{
    ConversationKind, ConversationUpdate, MessageDraft, ParticipantId, SequenceNumber,
    TraceContext,
};
use support::{
    assert_quiet, eventually, expect_sequences, fast_config, wait_state, SharedBackends,
};
use time::OffsetDateTime;

fn group(title: &str) -> ConversationKind {
    ConversationKind::Group {
        title: title.to_string(),
        description: None,
    }
}

#[tokio::test]
async fn live_delivery_then_reconnect_replays_missed_messages() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("c1"), vec![alice, bob])
        .await
        .unwrap();

    let a = gateway.attach(alice).await.unwrap();
    let mut b = gateway.attach(bob).await.unwrap();

    // A 发送 "hi"，B 实时收到 seq 1
    let seq = gateway
        .submit(a.session_id(), conversation.id, b"hi".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    assert_eq!(seq, SequenceNumber::new(1));
    let hi = tokio::time::timeout(support::WAIT, b.recv()).await.unwrap().unwrap();
    assert_eq!(hi.sequence, SequenceNumber::new(1));
    assert_eq!(hi.payload, b"hi".to_vec());
    gateway
        .acknowledge(b.session_id(), conversation.id, hi.sequence)
        .await
        .unwrap();

    // B 断开，A 继续发送
    gateway.detach(b.session_id()).await;
    gateway.detach(b.session_id()).await;
    assert!(b.recv().await.is_none());
    let seq = gateway
        .submit(a.session_id(), conversation.id, b"there".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    assert_eq!(seq, SequenceNumber::new(2));

    // B 重连：先追赶，重放 seq 2，然后转入实时
    let mut b = gateway.attach(bob).await.unwrap();
    let there = tokio::time::timeout(support::WAIT, b.recv()).await.unwrap().unwrap();
    assert_eq!(there.sequence, SequenceNumber::new(2));
    assert_eq!(there.payload, b"there".to_vec());
    wait_state(&b, SupervisorState::Live).await;
    assert_quiet(&mut b, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn reconnect_without_receipts_replays_everything_once() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("replay"), vec![alice, bob])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();

    for i in 0..25 {
        gateway
            .submit(
                a.session_id(),
                conversation.id,
                format!("m{i}").into_bytes(),
                TraceContext::empty(),
            )
            .await
            .unwrap();
    }

    // 重放与实时消息交错，去重后每条只收到一次
    let mut b = gateway.attach(bob).await.unwrap();
    let sender = {
        let gateway = gateway.clone();
        let session = a.session_id();
        let conversation = conversation.id;
        tokio::spawn(async move {
            for i in 25..40 {
                gateway
                    .submit(session, conversation, format!("m{i}").into_bytes(), TraceContext::empty())
                    .await
                    .unwrap();
            }
        })
    };
    expect_sequences(&mut b, 1..=40).await;
    sender.await.unwrap();
    assert_quiet(&mut b, Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_get_gap_free_sequences() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let senders: Vec<ParticipantId> = (0..3).map(|_| ParticipantId::random()).collect();
    let observer = ParticipantId::random();
    let mut members = senders.clone();
    members.push(observer);
    let conversation = gateway.open_conversation(group("busy"), members).await.unwrap();

    let mut watch = gateway.attach(observer).await.unwrap();
    let mut sessions = Vec::new();
    for sender in &senders {
        sessions.push(gateway.attach(*sender).await.unwrap());
    }

    let handles: Vec<_> = (0..30)
        .map(|i| {
            let gateway = gateway.clone();
            let session = sessions[i % sessions.len()].session_id();
            let conversation = conversation.id;
            tokio::spawn(async move {
                gateway
                    .submit(session, conversation, vec![i as u8 + 1], TraceContext::new(format!("t{i}")))
                    .await
            })
        })
        .collect();

    let mut assigned = BTreeSet::new();
    for handle in futures::future::join_all(handles).await {
        let sequence = handle.unwrap().unwrap();
        assert!(assigned.insert(sequence.value()), "duplicate sequence {sequence}");
    }
    assert_eq!(assigned, (1..=30).collect::<BTreeSet<u64>>());

    let stored: Vec<u64> = backends
        .memory_log
        .snapshot(conversation.id)
        .await
        .iter()
        .map(|m| m.sequence.value())
        .collect();
    assert_eq!(stored, (1..=30).collect::<Vec<_>>());

    // 观察者按序收到全部消息
    expect_sequences(&mut watch, 1..=30).await;
}

#[tokio::test]
async fn acknowledging_twice_and_redelivery_are_noops() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("idem"), vec![alice, bob])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();
    let mut b = gateway.attach(bob).await.unwrap();

    gateway
        .submit(a.session_id(), conversation.id, b"one".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    expect_sequences(&mut b, [1]).await;

    for _ in 0..2 {
        gateway
            .acknowledge(b.session_id(), conversation.id, SequenceNumber::new(1))
            .await
            .unwrap();
    }
    // 更旧的确认不会回退
    gateway
        .acknowledge(b.session_id(), conversation.id, SequenceNumber::ZERO)
        .await
        .unwrap();
    assert_eq!(
        backends
            .receipts
            .last_acknowledged(bob, conversation.id)
            .await
            .unwrap(),
        SequenceNumber::new(1)
    );

    // 总线重复投递已送达的消息
    let stored = backends
        .log
        .get(conversation.id, SequenceNumber::new(1))
        .await
        .unwrap()
        .unwrap();
    backends.bus.publish(&stored).await.unwrap();
    assert_quiet(&mut b, Duration::from_millis(100)).await;

    gateway
        .submit(a.session_id(), conversation.id, b"two".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    expect_sequences(&mut b, [2]).await;
}

#[tokio::test]
async fn acknowledgement_cannot_run_ahead_of_delivery() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("ahead"), vec![alice, bob])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();
    let b = gateway.attach(bob).await.unwrap();
    wait_state(&b, SupervisorState::Live).await;

    // 还没有收到任何消息就确认 5
    let err = gateway
        .acknowledge(b.session_id(), conversation.id, SequenceNumber::new(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::AckAheadOfDelivery { sequence, delivered, .. }
            if sequence == SequenceNumber::new(5) && delivered == SequenceNumber::ZERO
    ));
    assert_eq!(
        backends
            .receipts
            .last_acknowledged(bob, conversation.id)
            .await
            .unwrap(),
        SequenceNumber::ZERO
    );

    gateway.detach(b.session_id()).await;
    for text in ["one", "two", "three"] {
        gateway
            .submit(a.session_id(), conversation.id, text.as_bytes().to_vec(), TraceContext::empty())
            .await
            .unwrap();
    }

    // 重连后一条都不少
    let mut b = gateway.attach(bob).await.unwrap();
    expect_sequences(&mut b, 1..=3).await;
    gateway
        .acknowledge(b.session_id(), conversation.id, SequenceNumber::new(3))
        .await
        .unwrap();
}

#[tokio::test]
async fn group_update_moves_live_delivery_between_members() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let carol = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("before"), vec![alice, bob])
        .await
        .unwrap();
    assert_eq!(conversation.admin, Some(alice));

    let a = gateway.attach(alice).await.unwrap();
    let mut b = gateway.attach(bob).await.unwrap();
    let mut c = gateway.attach(carol).await.unwrap();
    gateway
        .submit(a.session_id(), conversation.id, b"first".to_vec(), TraceContext::empty())
        .await
        .unwrap();
    expect_sequences(&mut b, [1]).await;

    let updated = gateway
        .update_conversation(
            conversation.id,
            ConversationUpdate {
                title: "after".to_string(),
                description: Some("moved".to_string()),
                admin: carol,
                participants: vec![alice, carol],
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.participants(), &[alice, carol]);
    assert_eq!(updated.admin, Some(carol));
    assert_eq!(gateway.conversation(conversation.id).await.unwrap(), updated);

    gateway
        .submit(a.session_id(), conversation.id, b"second".to_vec(), TraceContext::empty())
        .await
        .unwrap();

    // 新成员从头重放，被移除的成员不再收到
    expect_sequences(&mut c, 1..=2).await;
    assert_quiet(&mut b, Duration::from_millis(100)).await;
    assert!(matches!(
        gateway
            .submit(b.session_id(), conversation.id, b"still here?".to_vec(), TraceContext::empty())
            .await,
        Err(GatewayError::Ingest(IngestError::Validation(
            ValidationError::InvalidSender { .. }
        )))
    ));
    assert!(matches!(
        gateway.history(b.session_id(), conversation.id, 10).await,
        Err(GatewayError::NotMember(_))
    ));

    let direct = gateway
        .open_conversation(ConversationKind::Direct, vec![alice, bob])
        .await
        .unwrap();
    assert!(matches!(
        gateway
            .update_conversation(
                direct.id,
                ConversationUpdate {
                    title: "nope".to_string(),
                    description: None,
                    admin: alice,
                    participants: vec![alice, bob],
                },
            )
            .await,
        Err(GatewayError::Domain(_))
    ));
    let missing = domain::ConversationId::random();
    assert!(matches!(
        gateway
            .update_conversation(
                missing,
                ConversationUpdate {
                    title: "ghost".to_string(),
                    description: None,
                    admin: alice,
                    participants: vec![alice],
                },
            )
            .await,
        Err(GatewayError::UnknownConversation(id)) if id == missing
    ));
}

#[tokio::test]
async fn conversations_are_listed_in_pages() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let mut opened = Vec::new();
    for i in 0..3 {
        let conversation = gateway
            .open_conversation(group(&format!("room {i}")), vec![alice])
            .await
            .unwrap();
        opened.push(conversation.id);
        // 创建时间不同，排序稳定
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let first: Vec<_> = gateway
        .list_conversations(0, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    let second: Vec<_> = gateway
        .list_conversations(1, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(first, opened[..2].to_vec());
    assert_eq!(second, opened[2..].to_vec());
    assert!(matches!(
        gateway.list_conversations(0, 0).await,
        Err(GatewayError::InvalidPageSize(0))
    ));
    assert!(matches!(
        gateway.list_conversations(0, 101).await,
        Err(GatewayError::InvalidPageSize(101))
    ));
}

#[tokio::test]
async fn single_message_lookup_by_sequence() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("lookup"), vec![alice])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();
    let outsider = gateway.attach(bob).await.unwrap();
    gateway
        .submit(a.session_id(), conversation.id, b"hello".to_vec(), TraceContext::new("t-1"))
        .await
        .unwrap();

    let message = gateway
        .message(a.session_id(), conversation.id, SequenceNumber::new(1))
        .await
        .unwrap();
    assert_eq!(message.payload, b"hello".to_vec());
    assert_eq!(message.trace.as_str(), Some("t-1"));
    assert!(matches!(
        gateway
            .message(a.session_id(), conversation.id, SequenceNumber::new(9))
            .await,
        Err(GatewayError::MessageNotFound { sequence, .. }) if sequence == SequenceNumber::new(9)
    ));
    assert!(matches!(
        gateway
            .message(outsider.session_id(), conversation.id, SequenceNumber::new(1))
            .await,
        Err(GatewayError::NotMember(_))
    ));
}

#[tokio::test]
async fn dispatcher_gap_forces_catch_up() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("gap"), vec![bob, ParticipantId::random()])
        .await
        .unwrap();
    let mut b = gateway.attach(bob).await.unwrap();
    eventually(|| gateway.dispatcher_stats().subscriptions >= 1).await;
    wait_state(&b, SupervisorState::Live).await;

    let message = |seq: u64| {
        MessageDraft::new(
            conversation.id,
            bob,
            format!("m{seq}").into_bytes(),
            OffsetDateTime::now_utc(),
            TraceContext::empty(),
        )
        .unwrap()
        .sequenced(SequenceNumber::new(seq))
    };

    // 模拟另一个实例：写入日志后发布到总线
    for seq in 1..=3 {
        backends.log.append(&message(seq)).await.unwrap();
        backends.bus.publish(&message(seq)).await.unwrap();
    }
    expect_sequences(&mut b, 1..=3).await;

    // seq 4 的发布丢失，分发器直接看到 seq 5
    backends.log.append(&message(4)).await.unwrap();
    backends.log.append(&message(5)).await.unwrap();
    backends.bus.publish(&message(5)).await.unwrap();

    expect_sequences(&mut b, [4, 5]).await;
    assert_eq!(gateway.dispatcher_stats().gaps, 1);
    wait_state(&b, SupervisorState::Live).await;
}

#[tokio::test]
async fn slow_consumer_recovers_through_replay() {
    let mut config = fast_config();
    config.delivery.channel_capacity = 2;
    config.delivery.transport_capacity = 1;
    config.delivery.catch_up_buffer = 4;
    config.delivery.replay_batch_size = 5;

    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&config);
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("slow"), vec![alice, bob])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();
    let mut b = gateway.attach(bob).await.unwrap();
    wait_state(&b, SupervisorState::Live).await;

    // B 暂不读取
    for i in 0..30u8 {
        gateway
            .submit(a.session_id(), conversation.id, vec![i + 1], TraceContext::empty())
            .await
            .unwrap();
    }
    eventually(|| gateway.publisher_stats().published == 30).await;
    // 投递通道容量很小，分发器必然把 B 标记为落后
    eventually(|| gateway.dispatcher_stats().behind >= 1).await;

    expect_sequences(&mut b, 1..=30).await;
    assert_quiet(&mut b, Duration::from_millis(50)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_instances_share_log_and_bus() {
    let backends = SharedBackends::in_memory();
    let first = backends.gateway(&fast_config());
    let second = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let carol = ParticipantId::random();
    let conversation = first
        .open_conversation(group("cluster"), vec![alice, bob, carol])
        .await
        .unwrap();

    let a = first.attach(alice).await.unwrap();
    let b = second.attach(bob).await.unwrap();
    let mut c = second.attach(carol).await.unwrap();

    let spawn_sender = |gateway: application::Gateway, session, prefix: &'static str| {
        let conversation = conversation.id;
        tokio::spawn(async move {
            for i in 0..10 {
                gateway
                    .submit(
                        session,
                        conversation,
                        format!("{prefix}{i}").into_bytes(),
                        TraceContext::empty(),
                    )
                    .await
                    .unwrap();
            }
        })
    };
    let h1 = spawn_sender(first.clone(), a.session_id(), "a");
    let h2 = spawn_sender(second.clone(), b.session_id(), "b");
    h1.await.unwrap();
    h2.await.unwrap();

    assert_eq!(
        backends.log.head(conversation.id).await.unwrap(),
        SequenceNumber::new(20)
    );
    expect_sequences(&mut c, 1..=20).await;
}

#[tokio::test]
async fn duplicate_attach_and_unknown_session_are_rejected() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let conversation = gateway
        .open_conversation(group("dup"), vec![alice, ParticipantId::random()])
        .await
        .unwrap();
    let a = gateway.attach(alice).await.unwrap();

    assert!(matches!(
        gateway.attach(alice).await,
        Err(GatewayError::Registry(_))
    ));
    assert_eq!(gateway.online_sessions(), 1);

    gateway.detach(a.session_id()).await;
    assert!(matches!(
        gateway
            .submit(a.session_id(), conversation.id, b"late".to_vec(), TraceContext::empty())
            .await,
        Err(GatewayError::UnknownSession(_))
    ));

    // 断开后可以重新连接
    let again = gateway.attach(alice).await.unwrap();
    assert_ne!(again.session_id(), a.session_id());
}

#[tokio::test]
async fn new_conversation_reaches_online_members() {
    let backends = SharedBackends::in_memory();
    let gateway = backends.gateway(&fast_config());
    let alice = ParticipantId::random();
    let bob = ParticipantId::random();
    let a = gateway.attach(alice).await.unwrap();
    let mut b = gateway.attach(bob).await.unwrap();

    let direct = gateway
        .open_conversation(ConversationKind::Direct, vec![alice, bob])
        .await
        .unwrap();
    gateway
        .submit(a.session_id(), direct.id, b"psst".to_vec(), TraceContext::empty())
        .await
        .unwrap();

    let message = tokio::time::timeout(support::WAIT, b.recv()).await.unwrap().unwrap();
    assert_eq!(message.conversation_id, direct.id);
    assert_eq!(message.payload, b"psst".to_vec());

    let history = gateway.history(b.session_id(), direct.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(matches!(
        gateway.history(b.session_id(), direct.id, 0).await,
        Err(GatewayError::InvalidLimit(0))
    ));
    assert!(matches!(
        gateway.history(b.session_id(), direct.id, 1001).await,
        Err(GatewayError::InvalidLimit(1001))
    ));

    assert!(matches!(
        gateway
            .open_conversation(ConversationKind::Direct, vec![alice])
            .await,
        Err(GatewayError::Domain(_))
    ));
}
