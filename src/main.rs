use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tasksmith::config::Config;
use tasksmith::queue::TaskStore;
use tasksmith::worker::{ShellExecutor, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let command = config.require_command()?.to_string();

    eprintln!("tasksmith v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Project: {}", config.project_root.display());
    eprintln!("   Command: {}", command);
    eprintln!("   Workers: {}\n", config.pool.max_concurrent);

    let store = Arc::new(
        TaskStore::open(&config.project_root)
            .await
            .with_context(|| format!("failed to open task store in {}", config.project_root.display()))?,
    );
    let workspaces = config.workspace.provider(&config.project_root);
    let executor = Arc::new(ShellExecutor::new(command).with_timeout(config.exec.timeout));
    let pool = Arc::new(WorkerPool::new(
        store.clone(),
        workspaces,
        executor,
        config.pool.clone(),
    ));

    let handle = pool.start(config.max_tasks)?;

    // Ctrl-C stops admission; in-flight tasks are allowed to finish
    let interrupt = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, waiting for in-flight tasks to finish");
                pool.stop(false).await;
            }
        })
    };

    let progress = handle.await.context("pool task aborted")??;
    interrupt.abort();

    let stats = store.stats().await?;
    info!(
        completed = progress.completed,
        failed = progress.failed,
        scheduling_failures = progress.scheduling_failures,
        remaining = stats.pending + stats.ready,
        "Run finished"
    );

    if !progress.is_success() {
        anyhow::bail!(
            "{} task(s) failed, {} scheduling failure(s)",
            progress.failed,
            progress.scheduling_failures
        );
    }
    Ok(())
}

/// Install the global subscriber: stdout, or a daily-rolling file under `log_dir`.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tasksmith.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
