use std::time::Duration;

use tracing_subscriber::EnvFilter;
use workers::ProcessorHost;

mod init;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let poll_interval = match std::env::var("POLL_INTERVAL_SECS") {
        Ok(raw) => Duration::from_secs(raw.trim().parse::<u64>()?.max(1)),
        Err(_) => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
    };

    let host = ProcessorHost::new();
    let processor = init::init_processor(&host).await?;
    let batch_size = processor.stats().job_capacity;

    tracing::info!("Polling for due jobs every {:?}", poll_interval);
    let mut ticker = tokio::time::interval(poll_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Received Ctrl-C, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                match processor.process_due(batch_size).await {
                    Ok(outcomes) if outcomes.is_empty() => {}
                    Ok(outcomes) => {
                        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
                        tracing::info!(
                            "Processed {} job(s), {} failed",
                            outcomes.len(),
                            failed
                        );
                        for outcome in outcomes.iter().filter(|o| !o.is_ok()) {
                            if let Err(e) = &outcome.result {
                                tracing::warn!(job_id = %outcome.job_id, "Job failed: {}", e);
                            }
                        }
                    }
                    Err(e) => tracing::error!("Failed to poll due jobs: {}", e),
                }
            }
        }
    }

    host.stop(SHUTDOWN_TIMEOUT).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
