mod common;

use std::time::Duration;

use bcast_core::{
    audience::AudienceSpec,
    broadcast::Strategy,
    config::Config,
    domain::{MessageId, OutboundMessage, SessionId},
    Error,
};
use common::{address, harness, seed_contacts, FakeTransport};

#[tokio::test]
async fn first_broadcast_ramps_and_the_next_one_uses_what_was_learned() {
    let h = harness(Config::default(), FakeTransport::default()).await;
    seed_contacts(&h.store, &h.session, 2000).await;
    let msg = OutboundMessage::text("hello");

    let first = h
        .engine
        .broadcast(&msg, &AudienceSpec::all_known(), &h.session)
        .await
        .unwrap();
    assert_eq!(first.strategy, Strategy::Anchored);
    assert_eq!(first.batch_sizes, vec![100, 500, 1000, 399]);
    assert_eq!(first.total_recipients, 2000);

    let learned = h.engine.learning().get(&h.session).await.unwrap();
    assert_eq!(learned.max_proven_batch_size, 1000);

    let second = h
        .engine
        .broadcast(&msg, &AudienceSpec::all_known(), &h.session)
        .await
        .unwrap();
    assert_eq!(second.batch_sizes, vec![1000, 999]);
    assert_ne!(first.anchor, second.anchor);
}

#[tokio::test]
async fn small_audience_goes_out_in_one_call() {
    let h = harness(Config::default(), FakeTransport::default()).await;
    seed_contacts(&h.store, &h.session, 40).await;

    let report = h
        .engine
        .broadcast(
            &OutboundMessage::text("hi"),
            &AudienceSpec::all_known().with_self(),
            &h.session,
        )
        .await
        .unwrap();

    assert_eq!(report.strategy, Strategy::Direct);
    assert_eq!(h.transport.call_sizes(), vec![41]);
    let calls = h.transport.calls.lock().unwrap();
    assert_eq!(calls[0].recipients[0], address(999_999));
    assert!(calls[0].anchor_id.is_none());
    drop(calls);
    assert!(h.engine.learning().get(&h.session).await.is_none());
}

#[tokio::test]
async fn failed_anchor_stops_the_broadcast() {
    let transport = FakeTransport::default();
    transport.fail_call(0);
    let h = harness(Config::default(), transport).await;
    seed_contacts(&h.store, &h.session, 300).await;

    let err = h
        .engine
        .broadcast(&OutboundMessage::text("hi"), &AudienceSpec::all_known(), &h.session)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FatalAnchor { .. }));
    assert_eq!(h.transport.call_sizes(), vec![1]);
}

#[tokio::test]
async fn missing_named_list_is_rejected_before_sending() {
    let h = harness(Config::default(), FakeTransport::default()).await;
    seed_contacts(&h.store, &h.session, 10).await;

    let err = h
        .engine
        .broadcast(&OutboundMessage::text("hi"), &AudienceSpec::named("vip"), &h.session)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NamedListNotFound(_)));
    assert!(h.transport.call_sizes().is_empty());
}

#[tokio::test]
async fn unregistered_session_is_an_error() {
    let h = harness(Config::default(), FakeTransport::default()).await;
    let ghost = SessionId::new("ghost");
    let err = h
        .engine
        .enqueue_broadcast(OutboundMessage::text("hi"), AudienceSpec::all_known(), &ghost, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSession(s) if s == ghost));
}

#[tokio::test(start_paused = true)]
async fn queued_and_direct_broadcasts_never_overlap() {
    let h = harness(
        Config::default(),
        FakeTransport::with_latency(Duration::from_millis(20)),
    )
    .await;
    seed_contacts(&h.store, &h.session, 250).await;
    let msg = OutboundMessage::text("hi");

    let t1 = h
        .engine
        .enqueue_broadcast(msg.clone(), AudienceSpec::all_known(), &h.session, 3)
        .await
        .unwrap();
    let t2 = h
        .engine
        .enqueue_broadcast(msg.clone(), AudienceSpec::explicit(["447000001"]), &h.session, 3)
        .await
        .unwrap();
    let direct = h
        .engine
        .broadcast(&msg, &AudienceSpec::all_known(), &h.session)
        .await
        .unwrap();

    let r1 = t1.wait().await.unwrap();
    let r2 = t2.wait().await.unwrap();
    assert_eq!(direct.total_recipients, 250);
    assert_eq!(r1.total_recipients, 250);
    assert_eq!(r2.batch_sizes, vec![1]);
    assert_eq!(h.transport.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn queued_broadcast_is_retried_after_a_failure() {
    let transport = FakeTransport::default();
    // direct send of 5 fails once, then goes through
    transport.fail_call(0);
    let h = harness(Config::default(), transport).await;
    seed_contacts(&h.store, &h.session, 5).await;

    let ticket = h
        .engine
        .enqueue_broadcast(OutboundMessage::text("hi"), AudienceSpec::all_known(), &h.session, 3)
        .await
        .unwrap();
    let report = ticket.wait().await.unwrap();
    assert_eq!(report.batch_sizes, vec![5]);
    assert_eq!(h.transport.call_sizes(), vec![5, 5]);
    assert!(h.engine.queue_snapshot(&h.session).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_queue_item_reports_attempts() {
    let transport = FakeTransport::default();
    transport.fail_call(0);
    transport.fail_call(1);
    let h = harness(Config::default(), transport).await;
    seed_contacts(&h.store, &h.session, 5).await;

    let err = h
        .engine
        .enqueue_broadcast(OutboundMessage::text("hi"), AudienceSpec::all_known(), &h.session, 2)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueExhausted { attempts: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn failing_batch_is_narrowed_down_to_the_bad_recipient() {
    let transport = FakeTransport::default();
    transport.poison(address(5));
    let h = harness(Config::default(), transport).await;
    let recipients: Vec<_> = (0..8).map(address).collect();
    let anchor = MessageId("WAMID-anchor".into());

    let report = h
        .engine
        .isolate_failures(
            &h.session,
            &OutboundMessage::text("hi"),
            &recipients,
            Some(anchor.clone()),
        )
        .await
        .unwrap();

    assert_eq!(report.problematic, vec![address(5)]);
    let mut expected = recipients.clone();
    expected.remove(5);
    assert_eq!(report.succeeded, expected);
    // whole set, [0..4], [4, 5], [6, 7], [4], [5]
    assert_eq!(report.attempts, 6);
    assert_eq!(h.transport.call_sizes(), vec![8, 4, 2, 2, 1, 1]);
    assert!(h
        .transport
        .calls
        .lock()
        .unwrap()
        .iter()
        .all(|c| c.anchor_id.as_ref() == Some(&anchor)));
}
