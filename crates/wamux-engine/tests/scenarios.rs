// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios through the engine facade.

use std::sync::Arc;
use std::time::Duration;

use wamux_bus::WamuxEvent;
use wamux_core::{DisconnectReason, Payload, SessionState, WamuxError};
use wamux_engine::SendOptions;
use wamux_queue::JobStatus;
use wamux_test_utils::{AutoConnect, MockClient, TestHarness, drain_events};

#[tokio::test(start_paused = true)]
async fn capacity_two_evicts_idle_lru_or_rejects() {
    let harness = TestHarness::builder().with_capacity(2).build();
    let a = TestHarness::tenant("a");
    let b = TestHarness::tenant("b");
    let c = TestHarness::tenant("c");

    assert!(harness.engine.create_session(&a).await.is_ok());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(harness.engine.create_session(&b).await.is_ok());

    let outcome = harness.engine.create_session(&c).await;
    assert!(outcome.is_ok());
    assert_eq!(harness.engine.get_session_status(&a), None);
    assert!(harness.engine.get_session_status(&b).is_some());

    // Pin both remaining sessions with leases: nothing is evictable.
    let registry = harness.engine.registry();
    let _b = registry.acquire(&b, Default::default()).await.unwrap();
    let _c = registry.acquire(&c, Default::default()).await.unwrap();
    let rejected = harness.engine.create_session(&a).await;
    assert!(!rejected.is_ok());
    assert!(rejected.retryable);
    assert!(rejected.error.unwrap().contains("capacity"));
    assert!(harness.client.peak_live_handles() <= 2);
}

#[tokio::test(start_paused = true)]
async fn network_drop_exhausts_reconnects_and_fails() {
    let harness = TestHarness::builder()
        .with_reconnect(Duration::from_millis(1000), 3)
        .build();
    let mut events = harness.subscribe();
    let s = harness.ready_session("s").await.unwrap();
    assert_eq!(harness.client.creations(&s), 1);

    harness.client.fail_all_creates(true);
    assert!(harness.client.disconnect(&s, DisconnectReason::Network));

    assert!(
        harness
            .wait_for_state(&s, SessionState::Failed, Duration::from_secs(60))
            .await
    );
    assert_eq!(harness.client.creations(&s), 4);
    assert!(harness.engine.pending_reconnection(&s).is_none());

    // No timer fires after the terminal transition.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.client.creations(&s), 4);
    assert_eq!(harness.engine.get_session_status(&s), Some(SessionState::Failed));

    let events = drain_events(&mut events);
    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|event| match event {
            WamuxEvent::ReconnectScheduled { tenant, delay, .. } if *tenant == s => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000)
        ]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        WamuxEvent::ReconnectExhausted { tenant, attempts: 3, .. } if *tenant == s
    )));
}

#[tokio::test(start_paused = true)]
async fn second_send_within_window_is_rate_limited_then_delivered() {
    let harness = TestHarness::builder()
        .with_rate_limit(1, Duration::from_secs(10))
        .build();
    let mut events = harness.subscribe();
    let t = harness.ready_session("t").await.unwrap();

    let first = harness
        .engine
        .send_message(&t, "R", Payload::text("one"), SendOptions::default())
        .unwrap();
    let second = harness
        .engine
        .send_message(&t, "R", Payload::text("two"), SendOptions::default())
        .unwrap();

    assert!(harness.wait_idle(Duration::from_secs(60)).await);
    assert_eq!(harness.engine.job_status(first), Some(JobStatus::Completed));
    assert_eq!(harness.engine.job_status(second), Some(JobStatus::Completed));
    assert!(harness.engine.dead_letters("outbound").unwrap().is_empty());
    assert_eq!(harness.client.sent_count(), 2);

    let retries: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            WamuxEvent::MessageRetrying { job_id, error, attempts, .. } => {
                Some((job_id, error, attempts))
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries.len(), 1);
    let (job_id, error, attempts) = &retries[0];
    assert!(*job_id == first || *job_id == second);
    assert!(error.contains("rate limited"));
    assert_eq!(*attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn failing_sends_end_in_dead_letter_queue() {
    let harness = TestHarness::builder().build();
    let t = harness.ready_session("t").await.unwrap();
    harness.client.fail_all_sends(true);

    let job = harness
        .engine
        .send_message(
            &t,
            "bob",
            Payload::text("never"),
            SendOptions {
                max_attempts: Some(3),
                ..SendOptions::default()
            },
        )
        .unwrap();
    assert!(harness.wait_idle(Duration::from_secs(120)).await);

    let letters = harness.engine.dead_letters("outbound").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job.id, job);
    assert_eq!(letters[0].attempts, 3);
    assert!(!letters[0].error.is_empty());

    let stats = harness
        .engine
        .get_queue_stats()
        .into_iter()
        .find(|stats| stats.name == "outbound")
        .unwrap();
    assert_eq!((stats.pending, stats.in_flight, stats.dead_lettered), (0, 0, 1));

    harness.client.fail_all_sends(false);
    harness.engine.retry_dead_letter("outbound", job).unwrap();
    assert!(harness.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(harness.engine.job_status(job), Some(JobStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn logout_is_terminal_and_not_retried() {
    let harness = TestHarness::builder().build();
    let s = harness.ready_session("s").await.unwrap();
    harness.client.disconnect(&s, DisconnectReason::LoggedOut);

    assert!(
        harness
            .wait_for_state(&s, SessionState::Failed, Duration::from_secs(1))
            .await
    );
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.client.creations(&s), 1);

    // Failed sessions reject work until destroyed and recreated.
    let lease = harness.engine.registry().acquire(&s, Default::default()).await;
    assert!(matches!(lease, Err(WamuxError::SessionUnhealthy { .. })));
    assert!(harness.engine.destroy_session(&s).await);
    assert!(harness.engine.create_session(&s).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn failed_session_is_not_retryable_and_dead_letters_at_once() {
    let harness = TestHarness::builder().build();
    let s = harness.ready_session("s").await.unwrap();
    harness.client.disconnect(&s, DisconnectReason::LoggedOut);
    assert!(
        harness
            .wait_for_state(&s, SessionState::Failed, Duration::from_secs(1))
            .await
    );

    let outcome = harness.engine.create_session(&s).await;
    assert!(!outcome.is_ok());
    assert!(!outcome.retryable);
    assert_eq!(outcome.status, Some(SessionState::Failed));

    let mut events = harness.subscribe();
    let started = tokio::time::Instant::now();
    let job = harness
        .engine
        .send_message(
            &s,
            "bob",
            Payload::text("unreachable"),
            SendOptions {
                max_attempts: Some(5),
                ..SendOptions::default()
            },
        )
        .unwrap();
    assert!(harness.wait_idle(Duration::from_secs(60)).await);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(harness.engine.job_status(job), Some(JobStatus::DeadLettered));
    let letters = harness.engine.dead_letters("outbound").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 1);
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|event| matches!(event, WamuxEvent::MessageRetrying { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn credential_challenge_is_published_and_checkpointed() {
    let harness = TestHarness::builder()
        .with_checkpoints()
        .with_auto_connect(AutoConnect::Challenge("qr-payload".into()))
        .build();
    let mut events = harness.subscribe();
    let t = TestHarness::tenant("t");

    harness.engine.create_session(&t).await;
    assert!(
        harness
            .wait_for_state(&t, SessionState::WaitingCredential, Duration::from_secs(1))
            .await
    );
    assert_eq!(
        harness.engine.pending_challenge(&t).await.as_deref(),
        Some("qr-payload")
    );
    assert!(drain_events(&mut events).iter().any(|event| matches!(
        event,
        WamuxEvent::CredentialChallenge { data, attempt: 1, .. } if data == "qr-payload"
    )));
}

#[tokio::test(start_paused = true)]
async fn checkpointed_session_is_restored_after_restart() {
    let first = TestHarness::builder().with_checkpoints().build();
    let t = first.ready_session("t").await.unwrap();
    first.shutdown().await;

    let store = first.store.clone();
    let second = TestHarness::builder()
        .with_checkpoints()
        .build_with(MockClient::new(), Arc::clone(&store));
    let restored = second.engine.restore_session(&t).await.unwrap();
    assert!(restored.is_some());
    assert!(
        second
            .wait_for_state(&t, SessionState::Ready, Duration::from_secs(1))
            .await
    );

    // An explicit destroy deletes the checkpoint.
    assert!(second.engine.destroy_session(&t).await);
    assert_eq!(second.engine.restore_session(&t).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn paused_queue_holds_messages() {
    let harness = TestHarness::builder().build();
    let t = harness.ready_session("t").await.unwrap();
    assert!(harness.engine.pause_queue("outbound").unwrap());

    let job = harness
        .engine
        .send_message(&t, "bob", Payload::text("wait"), SendOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.engine.job_status(job), Some(JobStatus::Pending));

    assert!(harness.engine.resume_queue("outbound").unwrap());
    assert!(harness.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(harness.engine.job_status(job), Some(JobStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn cancelled_reconnection_stays_disconnected_until_resumed() {
    let harness = TestHarness::builder()
        .with_reconnect(Duration::from_millis(1000), 3)
        .build();
    let s = harness.ready_session("s").await.unwrap();
    harness.client.disconnect(&s, DisconnectReason::ConnectionLost);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(harness.engine.cancel_reconnection(&s));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.engine.get_session_status(&s), Some(SessionState::Disconnected));
    assert_eq!(harness.client.creations(&s), 1);

    assert!(harness.engine.resume_reconnection(&s).await.is_some());
    assert!(
        harness
            .wait_for_state(&s, SessionState::Ready, Duration::from_secs(10))
            .await
    );
    assert_eq!(harness.client.creations(&s), 2);
}
