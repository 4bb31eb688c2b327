use adsight_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    adsight_observability::init(&config.log);

    let pool = adsight_worker::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; waiting for in-flight jobs");

    let stats = pool.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        warnings = stats.best_effort_warnings,
        "worker stopped"
    );
    Ok(())
}
