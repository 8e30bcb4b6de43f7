// SPDX-FileCopyrightText: 2026 Wamux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pool-wide properties of the session registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use wamux_bus::{DestroyCause, EventBus};
use wamux_core::{TenantId, WamuxError};
use wamux_session::{AcquireOptions, Checkpointer, RegistrySettings, SessionLease, SessionRegistry};
use wamux_test_utils::MockClient;

fn tenant(i: usize) -> TenantId {
    TenantId::parse(format!("tenant-{i}")).unwrap()
}

fn registry(client: &MockClient, capacity: usize) -> SessionRegistry {
    SessionRegistry::new(
        Arc::new(client.clone()),
        RegistrySettings {
            capacity,
            ..RegistrySettings::default()
        },
        EventBus::default(),
        Checkpointer::disabled(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_creates_one_client() {
    let client = MockClient::new();
    client.set_create_delay(Some(Duration::from_millis(20)));
    let registry = registry(&client, 8);
    let id = tenant(0);

    let callers: Vec<_> = (0..32)
        .map(|_| {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move {
                registry
                    .acquire(&id, AcquireOptions::default())
                    .await
                    .map(drop)
            })
        })
        .collect();
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    assert_eq!(client.creations(&id), 1);
    assert_eq!(client.live_handles(), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_capacity_two_evicts_least_recently_active() {
    let client = MockClient::new();
    let registry = registry(&client, 2);

    drop(registry.acquire(&tenant(0), AcquireOptions::default()).await.unwrap());
    tokio::time::advance(Duration::from_secs(1)).await;
    drop(registry.acquire(&tenant(1), AcquireOptions::default()).await.unwrap());
    tokio::time::advance(Duration::from_secs(1)).await;

    drop(registry.acquire(&tenant(2), AcquireOptions::default()).await.unwrap());
    assert!(!registry.contains(&tenant(0)));
    assert!(registry.contains(&tenant(1)));
    assert!(registry.contains(&tenant(2)));
}

#[tokio::test(start_paused = true)]
async fn scenario_capacity_two_without_idle_sessions_fails() {
    let client = MockClient::new();
    let registry = registry(&client, 2);

    let _a = registry.acquire(&tenant(0), AcquireOptions::default()).await.unwrap();
    let _b = registry.acquire(&tenant(1), AcquireOptions::default()).await.unwrap();
    let err = registry
        .acquire(&tenant(2), AcquireOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WamuxError::CapacityExceeded { capacity: 2 }));
    assert_eq!(client.creations(&tenant(2)), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
    Destroy(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..6usize).prop_map(Op::Acquire),
        2 => (0..6usize).prop_map(Op::Release),
        1 => (0..6usize).prop_map(Op::Destroy),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_handles_never_exceed_capacity(
        capacity in 1..4usize,
        ops in proptest::collection::vec(op(), 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let client = MockClient::new();
            let registry = registry(&client, capacity);
            let mut held: HashMap<usize, SessionLease> = HashMap::new();

            for op in ops {
                match op {
                    Op::Acquire(i) => {
                        if let Ok(lease) = registry.acquire(&tenant(i), AcquireOptions::default()).await {
                            held.insert(i, lease);
                        }
                    }
                    Op::Release(i) => {
                        held.remove(&i);
                        registry.release(&tenant(i));
                    }
                    Op::Destroy(i) => {
                        held.remove(&i);
                        registry.destroy(&tenant(i), DestroyCause::Requested).await;
                    }
                }
                tokio::task::yield_now().await;
                assert!(client.live_handles() <= capacity);
                assert!(registry.len() <= capacity);
            }
            assert!(client.peak_live_handles() <= capacity);
        });
    }

    #[test]
    fn releasing_unacquired_ids_changes_nothing(ids in proptest::collection::vec(0..10usize, 1..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let client = MockClient::new();
            let registry = registry(&client, 2);
            for i in ids {
                assert!(!registry.release(&tenant(i)));
            }
            assert!(registry.is_empty());
            assert_eq!(client.total_creations(), 0);
        });
    }
}
