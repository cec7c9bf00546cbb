//! Concurrent register/unregister/publish against one registry.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_core::{Envelope, PublishOutcome, STATE_CHANGED_EVENT};
use relay_server::{Connection, EnvelopeSink, Registry};
use serde_json::json;

const SAGAS: [&str; 4] = ["s0", "s1", "s2", "s3"];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutation_and_publish() {
    let registry = Arc::new(Registry::new(256));
    let broadcaster = registry.spawn();

    let mut workers = Vec::new();
    for seed in 0..8u64 {
        let registry = Arc::clone(&registry);
        workers.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut held = Vec::new();
            for _ in 0..500 {
                let saga = SAGAS[rng.random_range(0..SAGAS.len())];
                match rng.random_range(0..3) {
                    0 => {
                        let (conn, rx) = Connection::new(saga, 4);
                        assert!(registry.register(saga, conn.clone()));
                        held.push((conn, rx));
                    }
                    1 if !held.is_empty() => {
                        let (conn, _rx) = held.swap_remove(rng.random_range(0..held.len()));
                        assert!(registry.unregister(conn.saga_id(), conn.id()));
                    }
                    _ => {
                        let _ = registry.publish(Envelope::new(
                            saga,
                            STATE_CHANGED_EVENT,
                            json!({ "seed": seed }),
                        ));
                    }
                }
                if rng.random_bool(0.1) {
                    tokio::task::yield_now().await;
                }
            }
            for (conn, _rx) in held {
                assert!(registry.unregister(conn.saga_id(), conn.id()));
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(registry.connection_count(), 0);
    assert_eq!(registry.saga_count(), 0);

    registry.stop();
    tokio::time::timeout(Duration::from_secs(5), broadcaster)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_subscriber_does_not_block_publishers() {
    let registry = Arc::new(Registry::new(8));
    let broadcaster = registry.spawn();

    // Never drained.
    let (stalled, _stalled_rx) = Connection::new("hot", 1);
    let sink: Arc<dyn EnvelopeSink> = stalled.clone();
    assert!(registry.register("hot", sink));

    let publisher = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for step in 0..10_000u64 {
                let _ = registry.publish(Envelope::new(
                    "hot",
                    STATE_CHANGED_EVENT,
                    json!({ "step": step }),
                ));
            }
        })
    };
    tokio::time::timeout(Duration::from_secs(5), publisher)
        .await
        .expect("publish blocked")
        .unwrap();

    let stats = registry.stats();
    assert_eq!(stats.published + stats.broadcast_drops, 10_000);

    for _ in 0..500 {
        let stats = registry.stats();
        if stats.fanned_out + stats.delivery_drops == stats.published {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = registry.stats();
    assert!(stats.published >= 2);
    assert_eq!(stats.fanned_out, 1);
    assert_eq!(stalled.drop_count(), stats.published - 1);

    registry.stop();
    broadcaster.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_races_concurrent_publishers() {
    let registry = Arc::new(Registry::new(64));
    let broadcaster = registry.spawn();

    let (conn, mut rx) = Connection::new("race", 16);
    assert!(registry.register("race", conn.clone()));
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let mut publishers = Vec::new();
    for worker in 0..4u64 {
        let registry = Arc::clone(&registry);
        publishers.push(tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                let outcome = registry.publish(Envelope::new(
                    "race",
                    STATE_CHANGED_EVENT,
                    json!({ "worker": worker, "n": sent }),
                ));
                if outcome == PublishOutcome::Rejected {
                    return sent;
                }
                sent += 1;
                if sent % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    // Stop only once publishing is under way.
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.stats().published < 100 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("publishers never started");
    registry.stop();

    tokio::time::timeout(Duration::from_secs(5), broadcaster)
        .await
        .expect("broadcaster did not stop")
        .unwrap();
    let mut attempted = 0;
    for publisher in publishers {
        attempted += tokio::time::timeout(Duration::from_secs(5), publisher)
            .await
            .expect("publisher did not observe stop")
            .unwrap();
    }

    let stats = registry.stats();
    assert!(stats.published >= 100);
    assert!(stats.rejected >= 4);
    assert_eq!(stats.published + stats.broadcast_drops, attempted);
    assert_eq!(
        registry.publish(Envelope::new("race", STATE_CHANGED_EVENT, json!({}))),
        PublishOutcome::Rejected
    );
    assert!(registry.is_stopped());

    assert!(registry.unregister("race", conn.id()));
    drain.abort();
}
