//! Worker process wiring: config → store → capabilities → orchestrator pool.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use adsight_ai::{Capabilities, NoopNotifier, UnconfiguredSnapshotSource};
use adsight_infra::adapters::{FsExporter, HttpAnalyzer, HttpEndpoint, HttpSnapshotSource, WebhookNotifier};
use adsight_infra::config::AppConfig;
use adsight_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use adsight_infra::orchestrator::{
    InMemoryStageWarningSink, Orchestrator, WorkerPool, WorkerPoolHandle,
};

/// Open the job store named by the config, creating the schema if needed.
pub async fn build_store(config: &AppConfig) -> Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresJobStore::connect(url)
                .await
                .context("failed to open Postgres job store")?;
            info!("using Postgres job store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; jobs are kept in memory only");
            Ok(InMemoryJobStore::arc())
        }
    }
}

/// Build the capability set. The analyzer is mandatory; the rest fall back
/// to no-op or unconfigured implementations.
pub fn build_capabilities(config: &AppConfig) -> Result<Capabilities> {
    let endpoint = |url: &str| HttpEndpoint::new(url, config.api_token.clone());

    let Some(analyzer_url) = &config.analyzer_url else {
        bail!("ADSIGHT_ANALYZER_URL must be set");
    };

    let snapshots: Arc<dyn adsight_ai::SnapshotSource> = match &config.snapshot_url {
        Some(url) => Arc::new(HttpSnapshotSource::new(endpoint(url))),
        None => {
            warn!("ADSIGHT_SNAPSHOT_URL not set; live account reports will fail");
            Arc::new(UnconfiguredSnapshotSource)
        }
    };
    let notifier: Arc<dyn adsight_ai::Notifier> = match &config.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(endpoint(url))),
        None => Arc::new(NoopNotifier),
    };

    Ok(Capabilities {
        analyzer: Arc::new(HttpAnalyzer::new(endpoint(analyzer_url))),
        exporter: Arc::new(FsExporter::new(config.artifact_dir.clone())),
        notifier,
        snapshots,
    })
}

pub async fn build_orchestrator(config: &AppConfig) -> Result<Arc<Orchestrator>> {
    let capabilities = build_capabilities(config)?;
    let store = build_store(config).await?;
    let orchestrator_config = config
        .orchestrator_config()
        .context("invalid orchestrator configuration")?;

    Ok(Arc::new(Orchestrator::new(
        store,
        capabilities,
        Arc::new(InMemoryStageWarningSink::new()),
        orchestrator_config,
    )))
}

/// Build everything and start the worker pool on the current runtime.
pub async fn start(config: &AppConfig) -> Result<WorkerPoolHandle> {
    let orchestrator = build_orchestrator(config).await?;
    let pool = WorkerPool::spawn(orchestrator, config.pool_config());
    info!(workers = pool.worker_count(), "worker pool started");
    Ok(pool)
}
