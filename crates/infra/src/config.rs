//! Process configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use adsight_observability::{LogConfig, LogFormat};

use crate::orchestrator::{OrchestratorConfig, StageTimeouts, WorkerPoolConfig};
use crate::service::SubmissionLimits;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub stale_claim_after: Duration,
    pub timeouts: StageTimeouts,
    pub max_upload_bytes: usize,
    /// Postgres job store when set; in-memory store otherwise.
    pub database_url: Option<String>,
    pub analyzer_url: Option<String>,
    pub snapshot_url: Option<String>,
    pub notify_url: Option<String>,
    pub api_token: Option<String>,
    pub artifact_dir: PathBuf,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            stale_claim_after: Duration::from_secs(900),
            timeouts: StageTimeouts::default(),
            max_upload_bytes: SubmissionLimits::default().max_upload_bytes,
            database_url: None,
            analyzer_url: None,
            snapshot_url: None,
            notify_url: None,
            api_token: None,
            artifact_dir: PathBuf::from("./artifacts"),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parsed::<u64>(key, get(key))?.map_or(default, Duration::from_secs))
        };

        let workers = parsed::<usize>("ADSIGHT_WORKERS", get("ADSIGHT_WORKERS"))?.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "ADSIGHT_WORKERS",
                value: "0".to_string(),
            });
        }

        let poll_interval = parsed::<u64>("ADSIGHT_POLL_INTERVAL_MS", get("ADSIGHT_POLL_INTERVAL_MS"))?
            .map_or(defaults.poll_interval, Duration::from_millis);

        let timeouts = StageTimeouts {
            normalize: secs("ADSIGHT_NORMALIZE_TIMEOUT_SECS", defaults.timeouts.normalize)?,
            analyze: secs("ADSIGHT_ANALYZE_TIMEOUT_SECS", defaults.timeouts.analyze)?,
            export: secs("ADSIGHT_EXPORT_TIMEOUT_SECS", defaults.timeouts.export)?,
            fetch_snapshot: secs("ADSIGHT_FETCH_TIMEOUT_SECS", defaults.timeouts.fetch_snapshot)?,
            notify: secs("ADSIGHT_NOTIFY_TIMEOUT_SECS", defaults.timeouts.notify)?,
        };

        let log_format = match get("ADSIGHT_LOG_FORMAT") {
            Some(value) => LogFormat::parse(&value).ok_or(ConfigError::Invalid {
                key: "ADSIGHT_LOG_FORMAT",
                value,
            })?,
            None => defaults.log.format,
        };

        Ok(Self {
            workers,
            poll_interval,
            stale_claim_after: secs("ADSIGHT_STALE_CLAIM_SECS", defaults.stale_claim_after)?,
            timeouts,
            max_upload_bytes: parsed("ADSIGHT_MAX_UPLOAD_BYTES", get("ADSIGHT_MAX_UPLOAD_BYTES"))?
                .unwrap_or(defaults.max_upload_bytes),
            database_url: get("DATABASE_URL"),
            analyzer_url: get("ADSIGHT_ANALYZER_URL"),
            snapshot_url: get("ADSIGHT_SNAPSHOT_URL"),
            notify_url: get("ADSIGHT_NOTIFY_URL"),
            api_token: get("ADSIGHT_API_TOKEN"),
            artifact_dir: get("ADSIGHT_ARTIFACT_DIR").map_or(defaults.artifact_dir, PathBuf::from),
            log: LogConfig {
                format: log_format,
                default_level: get("ADSIGHT_LOG_LEVEL").unwrap_or(defaults.log.default_level),
            },
        })
    }

    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig, ConfigError> {
        let stale_claim_after =
            chrono::Duration::from_std(self.stale_claim_after).map_err(|_| ConfigError::Invalid {
                key: "ADSIGHT_STALE_CLAIM_SECS",
                value: self.stale_claim_after.as_secs().to_string(),
            })?;
        Ok(OrchestratorConfig {
            timeouts: self.timeouts,
            stale_claim_after,
            max_source_bytes: self.max_upload_bytes,
            ..OrchestratorConfig::default()
        })
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            poll_interval: self.poll_interval,
            ..WorkerPoolConfig::default()
        }
    }

    pub fn submission_limits(&self) -> SubmissionLimits {
        SubmissionLimits {
            max_upload_bytes: self.max_upload_bytes,
            ..SubmissionLimits::default()
        }
    }
}

fn parsed<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value })
    })
    .transpose()
}
