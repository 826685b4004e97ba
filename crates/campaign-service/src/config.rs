use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use campaign_content::ContentConfig;
use campaign_orchestrator::{EngineConfig, RetryPolicy};
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "campaign-service")]
#[command(about = "Local HTTP service for durable campaign builds")]
pub struct Args {
    #[arg(long, env = "CAMPAIGN_BIND", default_value = "127.0.0.1:7071")]
    pub bind: SocketAddr,
    #[arg(long, env = "CAMPAIGN_HISTORY_DB", default_value = "./campaign_history.sqlite3")]
    pub history_db: PathBuf,
    /// Root directory for run artifacts. Without it runs cannot persist
    /// artifacts and status answers from the engine alone.
    #[arg(long, env = "CAMPAIGN_RESULTS_ROOT")]
    pub results_root: Option<PathBuf>,
    #[arg(long, env = "CAMPAIGN_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    pub operation_timeout_ms: u64,
    /// Optional YAML file with retry, content and runs settings.
    #[arg(long, env = "CAMPAIGN_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "CAMPAIGN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "CAMPAIGN_LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub retry: RetrySettings,
    pub content: ContentConfig,
    pub runs: RunsSettings,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    pub first_interval_ms: Option<u64>,
    pub backoff_coefficient: Option<f64>,
    pub max_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunsSettings {
    pub list_limit: Option<usize>,
}

impl FileConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML
    /// for this shape.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error for malformed YAML or unknown keys.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Engine settings with file overrides applied over the defaults.
    ///
    /// # Errors
    /// Returns an error for values the engine cannot run with.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let retry = RetryPolicy {
            max_attempts: self.retry.max_attempts.unwrap_or(defaults.retry.max_attempts),
            first_interval: self
                .retry
                .first_interval_ms
                .map_or(defaults.retry.first_interval, Duration::from_millis),
            backoff_coefficient: self
                .retry
                .backoff_coefficient
                .unwrap_or(defaults.retry.backoff_coefficient),
            max_interval: self
                .retry
                .max_interval_ms
                .map_or(defaults.retry.max_interval, Duration::from_millis),
        };

        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !retry.backoff_coefficient.is_finite() || retry.backoff_coefficient < 1.0 {
            bail!("retry.backoff_coefficient must be a finite number >= 1.0");
        }
        if retry.max_interval < retry.first_interval {
            bail!("retry.max_interval_ms must not be below retry.first_interval_ms");
        }

        let runs_list_limit = self.runs.list_limit.unwrap_or(defaults.runs_list_limit);
        if runs_list_limit == 0 {
            bail!("runs.list_limit must be at least 1");
        }

        Ok(EngineConfig {
            retry,
            runs_list_limit,
        })
    }
}

/// Everything the service needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub history_db: PathBuf,
    pub results_root: Option<PathBuf>,
    pub operation_timeout: Duration,
    pub engine: EngineConfig,
    pub content: ContentConfig,
    pub log_level: String,
    pub log_json: bool,
}

impl ServiceConfig {
    /// # Errors
    /// Returns an error when the config file is unreadable or invalid, or
    /// the operation timeout is zero.
    pub fn resolve(args: Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        if args.operation_timeout_ms == 0 {
            bail!("--operation-timeout-ms must be greater than zero");
        }
        Ok(Self {
            bind: args.bind,
            history_db: args.history_db,
            results_root: args.results_root,
            operation_timeout: Duration::from_millis(args.operation_timeout_ms),
            engine: file.engine_config()?,
            content: file.content,
            log_level: args.log_level,
            log_json: args.log_json,
        })
    }
}
