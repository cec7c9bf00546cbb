//! Ingest loop behaviour against a scripted source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{Envelope, Publish, PublishOutcome, STATE_CHANGED_EVENT};
use relay_ingest::{IngestError, IngestLoop, IngestStats, MessageSource, QueueMessage};
use serde_json::json;
use tokio_util::sync::CancellationToken;

enum Step {
    Message(QueueMessage),
    FetchError,
    /// Block until cancelled.
    Stall,
}

struct ScriptedSource {
    steps: VecDeque<Step>,
    committed: Arc<Mutex<Vec<i64>>>,
    fail_commits: bool,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> (Self, Arc<Mutex<Vec<i64>>>) {
        let committed = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                steps: steps.into(),
                committed: Arc::clone(&committed),
                fail_commits: false,
            },
            committed,
        )
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn fetch(&mut self) -> Result<QueueMessage, IngestError> {
        match self.steps.pop_front() {
            Some(Step::Message(m)) => Ok(m),
            Some(Step::FetchError) => Err(IngestError::Fetch("broker unavailable".into())),
            Some(Step::Stall) => std::future::pending().await,
            None => Err(IngestError::Closed),
        }
    }

    async fn commit(&mut self, message: &QueueMessage) -> Result<(), IngestError> {
        if self.fail_commits {
            return Err(IngestError::Commit("rebalance in progress".into()));
        }
        self.committed.lock().push(message.offset);
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Envelope>>,
    outcome: Option<PublishOutcome>,
}

impl Publish for Recorder {
    fn publish(&self, envelope: Envelope) -> PublishOutcome {
        self.seen.lock().push(envelope);
        self.outcome.unwrap_or(PublishOutcome::Queued)
    }
}

fn message(offset: i64, body: serde_json::Value) -> Step {
    Step::Message(QueueMessage {
        topic: "saga.events".into(),
        partition: 0,
        offset,
        key: None,
        payload: serde_json::to_vec(&body).unwrap(),
    })
}

fn raw(offset: i64, bytes: &[u8]) -> Step {
    Step::Message(QueueMessage {
        offset,
        ..QueueMessage::from_payload(bytes)
    })
}

#[tokio::test]
async fn routes_filters_and_commits_everything() {
    let (source, committed) = ScriptedSource::new(vec![
        message(0, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT, "payload": { "step": 1 } })),
        message(1, json!({ "saga_id": "abc", "type": "saga.other.event", "payload": {} })),
        raw(2, b"{not json"),
        message(3, json!({ "saga_id": "", "type": STATE_CHANGED_EVENT, "payload": {} })),
        message(4, json!({ "saga_id": "xyz", "type": STATE_CHANGED_EVENT })),
    ]);
    let recorder = Arc::new(Recorder::default());

    let stats = IngestLoop::new(source, recorder.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(
        stats,
        IngestStats {
            received: 5,
            published: 2,
            skipped_malformed: 1,
            filtered: 2,
            ..IngestStats::default()
        }
    );
    assert_eq!(*committed.lock(), vec![0, 1, 2, 3, 4]);

    let seen = recorder.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].saga_id, "abc");
    assert_eq!(seen[0].payload["step"], 1);
    assert_eq!(seen[1].saga_id, "xyz");
    assert!(seen[1].payload.is_null());
}

#[tokio::test]
async fn custom_event_type() {
    let (source, _) = ScriptedSource::new(vec![
        message(0, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
        message(1, json!({ "saga_id": "abc", "type": "saga.custom" })),
    ]);
    let recorder = Arc::new(Recorder::default());
    let stats = IngestLoop::new(source, recorder.clone())
        .with_event_type("saga.custom")
        .run(CancellationToken::new())
        .await;
    assert_eq!(stats.published, 1);
    assert_eq!(recorder.seen.lock()[0].event_type, "saga.custom");
}

#[tokio::test(start_paused = true)]
async fn fetch_errors_back_off_and_retry() {
    let (source, committed) = ScriptedSource::new(vec![
        Step::FetchError,
        Step::FetchError,
        message(7, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
    ]);
    let recorder = Arc::new(Recorder::default());

    let started = tokio::time::Instant::now();
    let stats = IngestLoop::new(source, recorder)
        .with_retry_backoff(Duration::from_millis(500))
        .run(CancellationToken::new())
        .await;

    assert_eq!(stats.fetch_errors, 2);
    assert_eq!(stats.published, 1);
    assert_eq!(*committed.lock(), vec![7]);
    assert!(started.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test]
async fn cancel_interrupts_blocked_fetch() {
    let (source, _) = ScriptedSource::new(vec![
        message(0, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
        Step::Stall,
    ]);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(IngestLoop::new(source, Arc::new(Recorder::default())).run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert_eq!(stats.received, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_backoff() {
    let (source, _) = ScriptedSource::new(vec![Step::FetchError, Step::Stall]);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(
        IngestLoop::new(source, Arc::new(Recorder::default()))
            .with_retry_backoff(Duration::from_secs(3600))
            .run(cancel.clone()),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    let stats = task.await.unwrap();
    assert_eq!(stats.fetch_errors, 1);
}

#[tokio::test]
async fn commit_failures_do_not_stop_the_loop() {
    let (mut source, committed) = ScriptedSource::new(vec![
        message(0, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
        message(1, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
    ]);
    source.fail_commits = true;
    let stats = IngestLoop::new(source, Arc::new(Recorder::default()))
        .run(CancellationToken::new())
        .await;
    assert_eq!(stats.published, 2);
    assert_eq!(stats.commit_failures, 2);
    assert!(committed.lock().is_empty());
}

#[tokio::test]
async fn registry_drops_are_counted_and_committed() {
    let (source, committed) = ScriptedSource::new(vec![
        message(0, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
        message(1, json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT })),
    ]);
    let recorder = Arc::new(Recorder {
        outcome: Some(PublishOutcome::Dropped),
        ..Recorder::default()
    });
    let stats = IngestLoop::new(source, recorder)
        .run(CancellationToken::new())
        .await;
    assert_eq!(stats.published, 0);
    assert_eq!(stats.dropped, 2);
    assert_eq!(*committed.lock(), vec![0, 1]);
}

#[tokio::test]
async fn pre_cancelled_loop_fetches_nothing() {
    let (source, committed) = ScriptedSource::new(vec![message(
        0,
        json!({ "saga_id": "abc", "type": STATE_CHANGED_EVENT }),
    )]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = IngestLoop::new(source, Arc::new(Recorder::default()))
        .run(cancel)
        .await;
    assert_eq!(stats, IngestStats::default());
    assert!(committed.lock().is_empty());
}
