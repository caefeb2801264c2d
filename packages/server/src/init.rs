//! Server initialization for the job processing system.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{DbConfig, open_store};
use queue_core::{QueueRecord, RecordStore};
use serde_json::json;
use workers::{Processor, ProcessorConfig, ProcessorHost, job_handler};

/// Connect the store, start the processor and register the demo handlers.
pub async fn init_processor(host: &ProcessorHost) -> Result<Arc<Processor>, Box<dyn std::error::Error>> {
    tracing::info!("Initializing job processor...");

    let db_config = DbConfig::from_env()?;
    let config = ProcessorConfig::from_env()?;

    let store: Arc<dyn RecordStore> = Arc::new(open_store(&db_config).await?);
    let processor = host.start(config, store.clone());

    register_demo_handlers(&processor)?;

    // Seed a demo record if nothing is waiting
    let due = store
        .list_due(Utc::now(), processor.config().reservation_window(), 1)
        .await?;
    if due.is_empty() {
        tracing::info!("Seeding demo job...");
        let record = QueueRecord::new(json!({
            "type": "echo",
            "name": "Demo echo",
            "description": "Seeded at startup",
            "message": "hello",
        }));
        store.save(&record).await?;
        tracing::info!("Seeded demo job: {}", record.id);
    }

    tracing::info!("Job processor initialized");
    Ok(processor)
}

fn register_demo_handlers(processor: &Processor) -> Result<(), workers::ProcessorError> {
    // Demo: Echo handler
    processor.register(job_handler!("echo", |ctx, job| {
        tracing::info!("Echo job: {:?}", job.payload);
        ctx.debug("echoed payload");
        Ok(())
    }))?;

    // Demo: Sleep handler
    processor.register(job_handler!("sleep", |_ctx, job| {
        let seconds = job.get("seconds").and_then(|v| v.as_u64()).unwrap_or(5);
        tracing::info!("Sleeping for {} seconds", seconds);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(())
    }))?;

    // Demo: Failing handler, stays in the queue with a growing attempt count
    processor.register(job_handler!("fail", |_ctx, job| {
        let should_fail = job.get("fail").and_then(|v| v.as_bool()).unwrap_or(true);
        if should_fail {
            Err("Intentional failure".into())
        } else {
            Ok(())
        }
    }))?;

    // Demo: Panicking handler
    processor.register(job_handler!("panic", |_ctx, job| {
        panic!("Intentional panic in job {}", job.id);
    }))?;

    Ok(())
}
