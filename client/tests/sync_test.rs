//! Integration tests for the sync coordinator.
//!
//! Time is paused in most tests, so timers, latency and backoff run instantly
//! and in a deterministic order.

use std::sync::Arc;
use std::time::Duration;

use canopy_engine::{
    DeviceSyncState, Document, Error as EngineError, FailureKind, FlushReason, NetworkQuality,
    RetryPolicy, SyncStatus, Version,
};
use canopy_sync::{
    FlushOutcome, JsonFilePersistence, MemoryPersistence, MemoryTransport, OperationFactory,
    Registration, SyncConfig, SyncEngine, SyncError,
};

/// Test helper bundling an engine with its in-memory collaborators.
struct Harness {
    engine: SyncEngine,
    transport: Arc<MemoryTransport>,
    persistence: Arc<MemoryPersistence>,
    factory: OperationFactory,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        let transport = MemoryTransport::new_shared();
        let persistence = MemoryPersistence::new_shared();
        let engine = SyncEngine::new(config, transport.clone(), persistence.clone());
        Self {
            engine,
            transport,
            persistence,
            factory: OperationFactory::new("tablet-1", "surveyor-1"),
        }
    }

    async fn register(&self, document_id: &str) {
        let registration = self
            .engine
            .register_document(Document::new(document_id, "Survey"))
            .await
            .unwrap();
        assert_eq!(
            registration,
            Registration::Registered {
                restored: 0,
                last_version: 0
            }
        );
    }

    async fn queue(&mut self, document_id: &str, count: usize) {
        for _ in 0..count {
            let op = self.factory.insert(document_id, 0, "x");
            self.engine.queue_operation(op).await.unwrap();
        }
    }

    fn assert_invariant(&self, document_id: &str) {
        let state = self.engine.get_sync_state(document_id).unwrap();
        assert_eq!(
            state.pending_operations,
            self.engine.queue_length(document_id)
        );
    }
}

fn versions(ops: &[canopy_engine::EditorOperation]) -> Vec<Version> {
    ops.iter().map(|op| op.version).collect()
}

#[tokio::test(start_paused = true)]
async fn batch_threshold_then_periodic_flush() {
    let mut h = Harness::new(SyncConfig::default());
    h.engine.start();
    h.register("doc-1").await;

    h.queue("doc-1", 150).await;
    h.engine.settle("doc-1").await;

    let batches = h.transport.batches_for("doc-1");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].operations.len(), 100);
    assert_eq!(h.engine.queue_length("doc-1"), 50);
    h.assert_invariant("doc-1");

    tokio::time::sleep(Duration::from_secs(301)).await;
    h.engine.settle("doc-1").await;

    let batches = h.transport.batches_for("doc-1");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].operations.len(), 50);
    assert_eq!(batches[1].base_version, 100);
    assert_eq!(h.engine.queue_length("doc-1"), 0);

    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert!(state.last_synced_at.is_some());
    assert_eq!(versions(&h.transport.operations("doc-1")), (1..=150).collect::<Vec<_>>());

    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn threshold_receipt_reports_trigger() {
    let mut h = Harness::new(SyncConfig::default().with_batch_size(3));
    h.register("doc-1").await;

    let first = h.factory.insert("doc-1", 0, "a");
    let receipt = h.engine.queue_operation(first).await.unwrap();
    assert_eq!(receipt.pending, 1);
    assert_eq!(receipt.trigger, None);

    h.queue("doc-1", 1).await;
    let third = h.factory.insert("doc-1", 0, "c");
    let receipt = h.engine.queue_operation(third).await.unwrap();
    assert_eq!(receipt.pending, 3);
    assert_eq!(receipt.trigger, Some(FlushReason::BatchThreshold));

    h.engine.settle("doc-1").await;
    assert_eq!(h.transport.version("doc-1"), 3);
}

#[tokio::test(start_paused = true)]
async fn documents_flush_concurrently() {
    let mut h = Harness::new(SyncConfig::default().with_batch_size(3));
    h.transport.set_latency(Some(Duration::from_secs(1)));
    let documents = ["doc-a", "doc-b", "doc-c"];
    for id in documents {
        h.register(id).await;
    }

    let started = tokio::time::Instant::now();
    for id in documents {
        h.queue(id, 5).await;
    }
    for id in documents {
        h.engine.settle(id).await;
    }

    assert_eq!(h.transport.max_in_flight(), 3);
    assert!(started.elapsed() < Duration::from_secs(2));
    for id in documents {
        let batches = h.transport.batches_for(id);
        assert_eq!(batches.len(), 1, "{id}");
        assert_eq!(batches[0].operations.len(), 3);
        assert_eq!(h.engine.queue_length(id), 2);
        h.assert_invariant(id);
    }
}

#[tokio::test(start_paused = true)]
async fn flushes_of_one_document_are_serialized() {
    let mut h = Harness::new(SyncConfig::default().with_batch_size(2));
    h.transport.set_latency(Some(Duration::from_secs(1)));
    h.register("doc-1").await;
    h.queue("doc-1", 6).await;

    let (a, b) = tokio::join!(
        h.engine.flush("doc-1", FlushReason::Explicit),
        h.engine.flush("doc-1", FlushReason::Explicit),
    );
    a.unwrap();
    b.unwrap();
    h.engine.settle("doc-1").await;

    assert_eq!(h.transport.max_in_flight(), 1);
    let bases: Vec<_> = h
        .transport
        .batches_for("doc-1")
        .iter()
        .map(|batch| batch.base_version)
        .collect();
    assert_eq!(bases, vec![0, 2, 4]);
    assert_eq!(versions(&h.transport.operations("doc-1")), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(h.engine.queue_length("doc-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_requeues_ahead_of_new_operations() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 10).await;

    h.transport.fail_next(1);
    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    match outcome {
        FlushOutcome::Failed { failure, retry_in } => {
            assert_eq!(failure.kind, FailureKind::Network);
            assert_eq!(retry_in, Some(Duration::from_secs(1)));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.retry_count, 1);
    assert_eq!(h.engine.queue_length("doc-1"), 10);
    h.assert_invariant("doc-1");

    h.queue("doc-1", 2).await;
    assert_eq!(
        h.engine.get_sync_state("doc-1").unwrap().status,
        SyncStatus::Pending
    );

    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Synced {
            sent: 12,
            version: 12,
            remaining: 0
        }
    );
    assert_eq!(
        versions(&h.transport.operations("doc-1")),
        (1..=12).collect::<Vec<_>>()
    );

    // The pending retry was cancelled by the successful flush.
    h.engine.settle("doc-1").await;
    assert_eq!(h.transport.attempts(), 2);
    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(state.retry_count, 0);
    assert!(state.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn timed_out_flush_is_retried() {
    let mut h = Harness::new(
        SyncConfig::default().with_flush_timeout(Duration::from_secs(30)),
    );
    h.register("doc-1").await;
    h.queue("doc-1", 4).await;

    h.transport.set_latency(Some(Duration::from_secs(60)));
    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    match outcome {
        FlushOutcome::Failed { failure, retry_in } => {
            assert_eq!(failure.kind, FailureKind::Timeout);
            assert!(retry_in.is_some());
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(h.engine.queue_length("doc-1"), 4);
    assert_eq!(h.transport.version("doc-1"), 0);
    assert_eq!(
        h.engine.get_sync_state("doc-1").unwrap().status,
        SyncStatus::Error
    );

    h.transport.set_latency(None);
    h.engine.settle("doc-1").await;

    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(h.transport.version("doc-1"), 4);
    assert_eq!(h.transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_budget() {
    let retry = RetryPolicy {
        initial_delay: Duration::from_secs(1),
        multiplier: 2,
        max_delay: Duration::from_secs(60),
        max_attempts: 2,
    };
    let mut h = Harness::new(SyncConfig::default().with_retry(retry));
    h.register("doc-1").await;
    h.queue("doc-1", 3).await;

    h.transport.fail_next(10);
    let started = tokio::time::Instant::now();
    h.engine.force_sync("doc-1").await.unwrap();
    h.engine.settle("doc-1").await;

    // First attempt plus two retries, one and two seconds apart.
    assert_eq!(h.transport.attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(3));

    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.status, SyncStatus::Error);
    assert_eq!(state.retry_count, 3);
    assert_eq!(
        state.last_error.map(|failure| failure.kind),
        Some(FailureKind::Network)
    );
    assert_eq!(h.engine.queue_length("doc-1"), 3);
    h.assert_invariant("doc-1");

    // A new edit gives the document a fresh budget and backoff.
    h.queue("doc-1", 1).await;
    assert_eq!(h.engine.get_sync_state("doc-1").unwrap().retry_count, 0);
    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    match outcome {
        FlushOutcome::Failed { retry_in, .. } => {
            assert_eq!(retry_in, Some(Duration::from_secs(1)));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.engine.get_sync_state("doc-1").unwrap().retry_count, 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn explicit_flush_renews_spent_retries() {
    let retry = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    let mut h = Harness::new(SyncConfig::default().with_retry(retry));
    h.register("doc-1").await;
    h.queue("doc-1", 2).await;

    h.transport.fail_next(2);
    h.engine.force_sync("doc-1").await.unwrap();
    h.engine.settle("doc-1").await;
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.engine.get_sync_state("doc-1").unwrap().retry_count, 2);

    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Synced {
            sent: 2,
            version: 2,
            remaining: 0
        }
    );
    assert_eq!(h.engine.get_sync_state("doc-1").unwrap().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn conflict_cancels_scheduled_retry() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 2).await;

    h.transport.fail_next(1);
    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    assert!(matches!(
        outcome,
        FlushOutcome::Failed {
            retry_in: Some(_),
            ..
        }
    ));

    let mut remote = OperationFactory::new("tablet-2", "surveyor-2");
    h.transport
        .apply_remote("doc-1", vec![remote.insert("doc-1", 0, "r")]);
    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Conflict { .. }));
    assert_eq!(h.transport.attempts(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.engine.settle("doc-1").await;
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(
        h.engine.get_sync_state("doc-1").unwrap().status,
        SyncStatus::Conflict
    );

    // A stray retry leaves a conflicted document alone.
    let outcome = h
        .engine
        .flush("doc-1", FlushReason::Retry { attempt: 1 })
        .await
        .unwrap();
    assert_eq!(outcome, FlushOutcome::AwaitingResolution);
    assert_eq!(h.transport.attempts(), 2);
    assert_eq!(h.engine.queue_length("doc-1"), 2);
}

#[tokio::test(start_paused = true)]
async fn conflict_waits_for_resolution() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;

    let mut remote = OperationFactory::new("tablet-2", "surveyor-2");
    h.transport.apply_remote(
        "doc-1",
        vec![remote.insert("doc-1", 0, "r"), remote.insert("doc-1", 0, "s")],
    );

    h.queue("doc-1", 2).await;
    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    match outcome {
        FlushOutcome::Conflict {
            server_version,
            server_operations,
        } => {
            assert_eq!(server_version, 2);
            assert_eq!(server_operations.len(), 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.status, SyncStatus::Conflict);
    assert_eq!(state.retry_count, 0);
    assert_eq!(h.engine.queue_length("doc-1"), 2);

    // Neither retries nor periodic passes touch a conflicted document.
    assert_eq!(h.engine.tick(), 0);
    h.engine.settle("doc-1").await;
    assert_eq!(h.transport.attempts(), 1);

    h.engine.resolve_conflict("doc-1", 2).await.unwrap();
    h.engine.settle("doc-1").await;

    assert_eq!(h.transport.version("doc-1"), 4);
    assert_eq!(h.engine.get_document("doc-1").unwrap().version, 4);
    assert_eq!(
        h.engine.get_sync_state("doc-1").unwrap().status,
        SyncStatus::Synced
    );
}

#[tokio::test(start_paused = true)]
async fn registering_twice_keeps_queue() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 3).await;

    let again = h
        .engine
        .register_document(Document::new("doc-1", "Other title"))
        .await
        .unwrap();
    assert_eq!(again, Registration::AlreadyRegistered);
    assert_eq!(h.engine.queue_length("doc-1"), 3);
    assert_eq!(h.engine.get_document("doc-1").unwrap().title, "Survey");
    assert_eq!(h.engine.document_ids(), vec!["doc-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unknown_documents() {
    let mut h = Harness::new(SyncConfig::default());

    assert_eq!(h.engine.queue_length("missing"), 0);
    assert!(h.engine.get_sync_state("missing").is_none());
    assert!(h.engine.drain("missing", 10).await.is_empty());

    let op = h.factory.insert("missing", 0, "x");
    let err = h.engine.queue_operation(op).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Engine(EngineError::UnregisteredDocument(_))
    ));
    assert!(err.is_caller_error());
    assert!(h.engine.force_sync("missing").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn invalid_operation_is_rejected() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 2).await;

    let out_of_bounds = h.factory.insert("doc-1", 40, "x");
    let err = h.engine.queue_operation(out_of_bounds).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Engine(EngineError::PositionOutOfBounds { .. })
    ));
    assert_eq!(h.engine.queue_length("doc-1"), 2);
    assert_eq!(h.engine.get_document("doc-1").unwrap().content, "xx");
    h.assert_invariant("doc-1");
}

#[tokio::test(start_paused = true)]
async fn drain_hands_back_head_of_queue() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 5).await;

    let drained = h.engine.drain("doc-1", 2).await;
    assert_eq!(versions(&drained), vec![1, 2]);
    assert_eq!(h.engine.queue_length("doc-1"), 3);
    let state = h.engine.get_sync_state("doc-1").unwrap();
    assert_eq!(state.devices["tablet-1"].pending_operations, 3);
    h.assert_invariant("doc-1");

    let rest = h.engine.drain("doc-1", 100).await;
    assert_eq!(versions(&rest), vec![3, 4, 5]);
    assert_eq!(h.engine.queue_length("doc-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn unregister_returns_undelivered_operations() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 3).await;
    assert!(h.persistence.contains("doc-1"));

    let undelivered = h.engine.unregister_document("doc-1").await.unwrap();
    assert_eq!(versions(&undelivered), vec![1, 2, 3]);
    assert!(!h.engine.is_registered("doc-1"));
    assert!(!h.persistence.contains("doc-1"));
    assert!(h.engine.unregister_document("doc-1").await.is_err());

    let op = h.factory.insert("doc-1", 0, "x");
    assert!(h.engine.queue_operation(op).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_state_changes() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    let mut rx = h.engine.subscribe("doc-1").unwrap();

    h.queue("doc-1", 2).await;
    rx.changed().await.unwrap();
    {
        let state = rx.borrow_and_update();
        assert_eq!(state.status, SyncStatus::Pending);
        assert_eq!(state.pending_operations, 2);
    }

    h.engine.force_sync("doc-1").await.unwrap();
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().status, SyncStatus::Synced);

    h.engine.unregister_document("doc-1").await.unwrap();
    assert!(rx.changed().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn offline_defers_until_reconnect() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;

    h.engine.set_online(false);
    assert!(!h.engine.is_online());
    h.queue("doc-1", 2).await;

    let outcome = h.engine.force_sync("doc-1").await.unwrap();
    assert_eq!(outcome, FlushOutcome::Offline);
    assert_eq!(h.transport.attempts(), 0);
    assert_eq!(
        h.engine.get_sync_state("doc-1").unwrap().status,
        SyncStatus::Offline
    );
    h.assert_invariant("doc-1");

    h.engine.set_online(true);
    h.engine.settle("doc-1").await;
    assert_eq!(h.transport.version("doc-1"), 2);
    assert_eq!(
        h.engine.get_sync_state("doc-1").unwrap().status,
        SyncStatus::Synced
    );
}

#[tokio::test(start_paused = true)]
async fn force_sync_all_reports_each_document() {
    let mut h = Harness::new(SyncConfig::default().with_batch_size(4));
    for id in ["doc-a", "doc-b"] {
        h.register(id).await;
    }
    h.queue("doc-a", 2).await;

    let mut outcomes = h.engine.force_sync_all().await;
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes[0].1.as_ref().unwrap(),
        &FlushOutcome::Synced {
            sent: 2,
            version: 2,
            remaining: 0
        }
    );
    assert_eq!(outcomes[1].1.as_ref().unwrap(), &FlushOutcome::Idle);
}

#[tokio::test(start_paused = true)]
async fn device_presence_keeps_pending_counts() {
    let mut h = Harness::new(SyncConfig::default());
    h.register("doc-1").await;
    h.queue("doc-1", 2).await;

    h.engine
        .record_device_presence(
            "doc-1",
            "tablet-1",
            DeviceSyncState {
                last_seen: 42,
                version: 0,
                pending_operations: 0,
                online: true,
                network_quality: NetworkQuality::Poor,
            },
        )
        .unwrap();

    let state = h.engine.get_sync_state("doc-1").unwrap();
    let device = &state.devices["tablet-1"];
    assert_eq!(device.pending_operations, 2);
    assert_eq!(device.network_quality, NetworkQuality::Poor);
}

#[tokio::test(start_paused = true)]
async fn queue_survives_restart() {
    let transport = MemoryTransport::new_shared();
    let persistence = MemoryPersistence::new_shared();
    let mut factory = OperationFactory::new("tablet-1", "surveyor-1");

    let first = SyncEngine::new(SyncConfig::default(), transport.clone(), persistence.clone());
    first
        .register_document(Document::new("doc-1", "Survey"))
        .await
        .unwrap();
    for _ in 0..3 {
        first
            .queue_operation(factory.insert("doc-1", 0, "x"))
            .await
            .unwrap();
    }
    first.shutdown().await;
    drop(first);

    let second = SyncEngine::new(SyncConfig::default(), transport.clone(), persistence);
    let registration = second
        .register_document(Document::new("doc-1", "Survey"))
        .await
        .unwrap();
    assert_eq!(
        registration,
        Registration::Registered {
            restored: 3,
            last_version: 3
        }
    );
    assert_eq!(second.queue_length("doc-1"), 3);
    assert_eq!(second.last_version("doc-1"), Some(3));
    assert_eq!(second.get_document("doc-1").unwrap().content, "xxx");

    // A fresh factory after the restart continues above the restored queue.
    let mut factory = OperationFactory::new("tablet-1", "surveyor-1");
    factory.observe(3);
    let receipt = second
        .queue_operation(factory.insert("doc-1", 3, "y"))
        .await
        .unwrap();
    assert_eq!(receipt.pending, 4);
    assert_eq!(second.get_document("doc-1").unwrap().content, "xxxy");

    let outcome = second.force_sync("doc-1").await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Synced {
            sent: 4,
            version: 4,
            remaining: 0
        }
    );
    assert_eq!(versions(&transport.operations("doc-1")), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn file_persistence_restores_queue() {
    let dir = std::env::temp_dir().join(format!("canopy-sync-{}", uuid::Uuid::new_v4()));
    let transport = MemoryTransport::new_shared();
    let mut factory = OperationFactory::new("tablet-1", "surveyor-1");

    {
        let persistence = Arc::new(JsonFilePersistence::open(&dir).await.unwrap());
        let engine = SyncEngine::new(SyncConfig::default(), transport.clone(), persistence);
        engine
            .register_document(Document::new("plot/7", "Plot 7"))
            .await
            .unwrap();
        for _ in 0..2 {
            engine
                .queue_operation(factory.insert("plot/7", 0, "oak "))
                .await
                .unwrap();
        }
        engine.shutdown().await;
    }

    let persistence = Arc::new(JsonFilePersistence::open(&dir).await.unwrap());
    let engine = SyncEngine::new(SyncConfig::default(), transport.clone(), persistence);
    let registration = engine
        .register_document(Document::new("plot/7", "Plot 7"))
        .await
        .unwrap();
    assert_eq!(
        registration,
        Registration::Registered {
            restored: 2,
            last_version: 2
        }
    );
    assert_eq!(engine.get_document("plot/7").unwrap().content, "oak oak ");

    let state = engine.get_sync_state("plot/7").unwrap();
    assert_eq!(state.status, SyncStatus::Pending);
    assert_eq!(state.pending_operations, 2);

    engine.force_sync("plot/7").await.unwrap();
    assert_eq!(transport.version("plot/7"), 2);

    engine.unregister_document("plot/7").await.unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
