//! Pool of worker tasks polling the store through one [`Orchestrator`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Orchestrator, OrchestratorStats};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker tasks.
    pub workers: usize,
    /// Sleep between polls when no job is claimable.
    pub poll_interval: Duration,
    /// Prefix for worker names (used as the claim's worker id and in logs).
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            name: "adsight-worker".to_string(),
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    orchestrator: Arc<Orchestrator>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    ///
    /// A worker finishes the job it is running (including best-effort stages)
    /// before it exits. Returns the final statistics.
    pub async fn shutdown(self) -> OrchestratorStats {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        self.orchestrator.stats()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }
}

#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` tasks on the current tokio runtime.
    pub fn spawn(orchestrator: Arc<Orchestrator>, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = (0..config.workers.max(1))
            .map(|i| {
                let name = format!("{}-{i}", config.name);
                tokio::spawn(worker_loop(
                    name,
                    orchestrator.clone(),
                    config.poll_interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            orchestrator,
        }
    }
}

async fn worker_loop(
    name: String,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker = %name, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match orchestrator.process_next(&name).await {
            // Keep draining while there is work.
            Ok(Some(outcome)) => {
                debug!(
                    worker = %name,
                    job = %outcome.job,
                    status = ?outcome.status,
                    warnings = outcome.warnings.len(),
                    "job finished"
                );
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(worker = %name, error = %e, "failed to process job"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    info!(worker = %name, "worker stopped");
}
