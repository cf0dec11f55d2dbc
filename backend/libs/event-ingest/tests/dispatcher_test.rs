//! Integration tests for the intake dispatcher
//!
//! Run tests:
//! ```bash
//! cargo test --package event-ingest --test dispatcher_test
//! ```

use event_ingest::{
    Delivery, Event, EventProcessor, FnEffect, IngestConfig, IngestDispatcher, NoopEffect,
    OutcomeKind, PartitionKey, ProcessingOutcome,
};
use futures::stream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn dispatcher_with_sentinel(sentinel: &str) -> IngestDispatcher {
    let config = IngestConfig {
        poison_sentinel: Some(sentinel.to_string()),
        dispatcher_queue_capacity: 4,
        ..IngestConfig::default()
    };
    let processor = EventProcessor::new(config, NoopEffect).expect("config is valid");
    IngestDispatcher::new(Arc::new(processor))
}

/// Test: run() returns outcomes in stream order
#[tokio::test]
async fn test_run_returns_outcomes_in_order() {
    let dispatcher = dispatcher_with_sentinel("poison");
    let deliveries = ["e1", "poison", "e1", "e2"]
        .into_iter()
        .map(Delivery::global);

    let outcomes = dispatcher.run(stream::iter(deliveries)).await.unwrap();
    let kinds: Vec<OutcomeKind> = outcomes.iter().map(|o| o.kind()).collect();

    assert_eq!(
        kinds,
        vec![
            OutcomeKind::Processed,
            OutcomeKind::Quarantined,
            OutcomeKind::DuplicateIgnored,
            OutcomeKind::Processed,
        ]
    );

    let snapshot = dispatcher.processor().snapshot().await;
    let global = snapshot.partition(&PartitionKey::global()).unwrap();
    assert_eq!(global.received.len(), 4);
    assert_eq!(global.processed.len(), 2);
    assert_eq!(global.quarantined.len(), 1);

    dispatcher.shutdown().await;
}

/// Test: interleaved keys keep their own arrival order through the queues
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_partitions_keep_order() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::clone(&seen);
    let effect = FnEffect::new(move |event: Event| {
        let recorder = Arc::clone(&recorder);
        async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            recorder.lock().push(event.payload().to_text_lossy());
            Ok(())
        }
    });
    let config = IngestConfig {
        dispatcher_queue_capacity: 2,
        ..IngestConfig::default()
    };
    let processor = Arc::new(EventProcessor::new(config, effect).unwrap());
    let dispatcher = IngestDispatcher::new(Arc::clone(&processor));

    let deliveries: Vec<Delivery> = (0..30)
        .map(|i| Delivery::new(format!("k{}", i % 3), format!("k{}-{}", i % 3, i / 3)))
        .collect();

    let outcomes = dispatcher.run(stream::iter(deliveries)).await.unwrap();
    assert!(outcomes.iter().all(|o| *o == ProcessingOutcome::Processed));
    dispatcher.shutdown().await;

    for k in 0..3 {
        let key = PartitionKey::new(format!("k{}", k));
        let received: Vec<String> = processor
            .received_events(&key)
            .await
            .iter()
            .map(|r| r.payload.to_string())
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("k{}-{}", k, i)).collect();
        assert_eq!(received, expected);

        let effects: Vec<String> = seen
            .lock()
            .iter()
            .filter(|p| p.starts_with(&format!("k{}-", k)))
            .cloned()
            .collect();
        assert_eq!(effects, expected);
    }
}

/// Test: shutdown drains what was already enqueued
#[tokio::test]
async fn test_shutdown_drains_pending_work() {
    let dispatcher = dispatcher_with_sentinel("poison");

    let mut receivers = Vec::new();
    for i in 0..3 {
        receivers.push(
            dispatcher
                .submit(Delivery::new("orders", format!("o{}", i)))
                .await
                .unwrap(),
        );
    }

    dispatcher.shutdown().await;

    for receiver in receivers {
        assert_eq!(receiver.await.unwrap(), ProcessingOutcome::Processed);
    }
    assert_eq!(
        dispatcher
            .processor()
            .received_events(&PartitionKey::new("orders"))
            .await
            .len(),
        3
    );
}
