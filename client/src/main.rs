//! Canopy Sync - runs a simulated editing session against an in-process backend.
//!
//! Useful for watching trigger, retry and persistence behaviour in the logs:
//! `RUST_LOG=canopy_sync=debug cargo run -p canopy-sync`.

use std::sync::Arc;
use std::time::Duration;

use canopy_engine::Document;
use canopy_sync::{
    JsonFilePersistence, MemoryPersistence, MemoryTransport, OperationFactory, Persistence,
    Registration, SyncConfig, SyncEngine,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canopy_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    tracing::info!(
        batch_size = config.batch_size,
        interval_secs = config.sync_interval.as_secs(),
        "Starting Canopy sync session"
    );

    let persistence: Arc<dyn Persistence> = match &config.data_dir {
        Some(dir) => Arc::new(JsonFilePersistence::open(dir).await?),
        None => MemoryPersistence::new_shared(),
    };
    let transport = MemoryTransport::new_shared();
    transport.set_latency(Some(Duration::from_millis(50)));

    let engine = SyncEngine::new(config, transport.clone(), persistence);
    engine.start();

    let mut factory = OperationFactory::new("tablet-1", "surveyor-1");
    let documents = ["plot-north", "plot-south", "street-trees"];
    for id in documents {
        let registration = engine
            .register_document(Document::new(id, id.replace('-', " ")))
            .await?;
        // Edits left over from an earlier session keep their versions.
        if let Registration::Registered { last_version, .. } = registration {
            factory.observe(last_version);
        }
    }

    // One flaky round trip to show requeue and retry.
    transport.fail_next(1);

    for (i, id) in documents.iter().cycle().take(30).enumerate() {
        let op = factory.insert(*id, 0, format!("tree {i}; "));
        engine.queue_operation(op).await?;
    }

    for (id, outcome) in engine.force_sync_all().await {
        tracing::info!(document_id = %id, ?outcome, "Forced sync");
    }
    for id in documents {
        engine.settle(id).await;
        let state = engine.get_sync_state(id);
        tracing::info!(
            document_id = %id,
            server_version = transport.version(id),
            ?state,
            "Final state"
        );
    }

    engine.shutdown().await;
    Ok(())
}
