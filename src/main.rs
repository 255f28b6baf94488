use std::sync::Arc;

use anyhow::Context;

use offload::config::{StoreConfig, WorkerConfig};
use offload::jobs::JobQueue;
use offload::store::{ConversationStore, Layout};
use offload::tools::ExecutorRegistry;
use offload::tools::builtin::{EchoExecutor, ShellExecutor};
use offload::worker::{Scheduler, WorkerDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let store_config = StoreConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;

    let layout = Layout::new(store_config.root.clone());
    layout
        .ensure_dirs()
        .await
        .with_context(|| format!("preparing storage root {}", store_config.root.display()))?;

    // ── Executors ────────────────────────────────────────────────────────
    let executors = Arc::new(ExecutorRegistry::new());
    executors.register_sync(Arc::new(EchoExecutor::new()));
    executors.register_sync(Arc::new(ShellExecutor::new()));

    let queue = JobQueue::new(layout.clone());

    eprintln!("offload v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Storage: {}", store_config.root.display());
    eprintln!("   Worker: {}", queue.worker_id());
    eprintln!(
        "   Poll: {}ms, max {} concurrent jobs",
        worker_config.poll_interval.as_millis(),
        worker_config.max_concurrent_jobs
    );
    eprintln!("   Executors: {}", executors.list().await.join(", "));
    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Scheduler::new(WorkerDeps {
        queue,
        conversations: ConversationStore::new(layout),
        executors,
        config: worker_config,
    });
    scheduler
        .start()
        .await
        .context("recovering stalled jobs")?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;

    tracing::info!(
        in_flight = scheduler.active_jobs(),
        "Shutting down, waiting for in-flight jobs"
    );
    scheduler.stop().await;
    scheduler.wait_idle().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
