#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use campaign_artifacts::{fetch_artifact, ArtifactStore, RunLocation};
use campaign_content::{ContentGenerator, EvidenceSource};
use campaign_domain::{
    ensure_non_empty, ArtifactKind, CampaignError, RunInput, RunPrefix, RuntimeStatus,
};
use campaign_history_core::{FailureDetails, InstanceRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod campaign;
mod engine;
pub mod export;
pub mod regenerate;
pub mod status;

pub use engine::{Disposition, Engine, OrchestrationContext, ReusePolicy, StartOutcome};

pub const API_CONTRACT_VERSION: &str = "campaign.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ActivityError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid activity input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("activity failed: {0}")]
    Failed(String),
    #[error("quality gate failed: {0}")]
    QualityGate(String),
}

impl ActivityError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Failed(_) => "failed",
            Self::QualityGate(_) => "quality_gate",
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Configuration(message)
            | Self::InvalidInput(message)
            | Self::NotFound(message)
            | Self::Failed(message)
            | Self::QualityGate(message) => message,
        }
    }

    /// Only plain failures are worth another attempt; the other kinds fail
    /// the same way every time.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    #[must_use]
    pub fn from_failure(failure: &FailureDetails) -> Self {
        let message = failure.message.clone();
        match failure.kind.as_str() {
            "configuration" => Self::Configuration(message),
            "invalid_input" => Self::InvalidInput(message),
            "not_found" => Self::NotFound(message),
            "quality_gate" => Self::QualityGate(message),
            _ => Self::Failed(message),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),
    #[error("unknown activity: {0}")]
    UnknownActivity(String),
    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),
    #[error("invalid orchestration input: {0}")]
    InvalidInput(String),
    #[error("non-deterministic replay at call {seq}: history has {expected}, body called {actual}")]
    NonDeterminism {
        seq: u32,
        expected: String,
        actual: String,
    },
    #[error("instance {0} was terminated")]
    Terminated(String),
    #[error("instance {0} was restarted while this drive was running")]
    Superseded(String),
    #[error("activity {name} failed: {source}")]
    Activity { name: String, source: ActivityError },
    #[error("history store error: {0}")]
    History(String),
}

impl EngineError {
    /// Failure details recorded on an instance that ends with this error.
    #[must_use]
    pub fn failure(&self) -> FailureDetails {
        match self {
            Self::Activity { source, .. } => FailureDetails::new(source.kind(), self.to_string()),
            Self::UnknownOrchestration(_) => FailureDetails::new("unknown_orchestration", self.to_string()),
            Self::UnknownActivity(_) => FailureDetails::new("unknown_activity", self.to_string()),
            Self::InvalidInstanceId(_) => FailureDetails::new("invalid_instance_id", self.to_string()),
            Self::InvalidInput(_) => FailureDetails::new("invalid_input", self.to_string()),
            Self::NonDeterminism { .. } => FailureDetails::new("non_determinism", self.to_string()),
            Self::Terminated(_) => FailureDetails::new("terminated", self.to_string()),
            Self::Superseded(_) => FailureDetails::new("superseded", self.to_string()),
            Self::History(_) => FailureDetails::new("history", self.to_string()),
        }
    }
}

pub(crate) fn history_error(err: anyhow::Error) -> EngineError {
    EngineError::History(format!("{err:#}"))
}

/// Errors surfaced by [`CampaignApi`] to transport layers.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] CampaignError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("storage error: {0}")]
    Storage(String),
}

fn storage_error(err: anyhow::Error) -> ApiError {
    ApiError::Storage(format!("{err:#}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_interval: Duration::from_millis(500),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, capped at `max_interval`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.first_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let cap = self.max_interval.as_secs_f64();
        if secs.is_nan() || secs >= cap {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub runs_list_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            runs_list_limit: 50,
        }
    }
}

/// Collaborators activities reach through. A missing artifact store is a
/// configuration error raised at the activity boundary.
#[derive(Clone)]
pub struct ActivityEnv {
    pub artifacts: Option<Arc<dyn ArtifactStore>>,
    pub content: Arc<dyn ContentGenerator>,
    pub evidence: Arc<dyn EvidenceSource>,
}

impl ActivityEnv {
    /// # Errors
    /// Returns a configuration error when no artifact store is configured.
    pub fn artifacts(&self) -> Result<&dyn ArtifactStore, ActivityError> {
        self.artifacts.as_deref().ok_or_else(|| {
            ActivityError::Configuration(
                "artifact store is not configured (set --results-root)".to_string(),
            )
        })
    }
}

pub type OrchestratorFn = fn(&mut OrchestrationContext<'_>, Value) -> Result<Value, EngineError>;
pub type ActivityFn = fn(&ActivityEnv, &Value) -> Result<Value, ActivityError>;
pub type FailureHookFn =
    fn(&ActivityEnv, &InstanceRecord, &FailureDetails) -> Result<(), ActivityError>;

pub struct OrchestrationDef {
    pub name: &'static str,
    pub run: OrchestratorFn,
    /// Invoked when an instance ends `Failed` or `Terminated`.
    pub on_failure: Option<FailureHookFn>,
}

pub struct ActivityDef {
    pub name: &'static str,
    pub run: ActivityFn,
}

pub static ORCHESTRATIONS: &[OrchestrationDef] = &[
    OrchestrationDef {
        name: campaign::ORCHESTRATION_NAME,
        run: campaign::run_campaign,
        on_failure: Some(campaign::mark_run_failed),
    },
    OrchestrationDef {
        name: regenerate::ORCHESTRATION_NAME,
        run: regenerate::run_regeneration,
        on_failure: None,
    },
];

pub static ACTIVITIES: &[ActivityDef] = &[
    ActivityDef {
        name: campaign::VALIDATE_INPUT,
        run: campaign::validate_input,
    },
    ActivityDef {
        name: campaign::EVIDENCE_BUILDER,
        run: campaign::evidence_builder,
    },
    ActivityDef {
        name: campaign::CAMPAIGN_DRAFT,
        run: campaign::campaign_draft,
    },
    ActivityDef {
        name: campaign::VALIDATOR,
        run: campaign::validator,
    },
    ActivityDef {
        name: regenerate::LOCATE_RUN,
        run: regenerate::locate_run,
    },
    ActivityDef {
        name: regenerate::REGENERATE_SECTION,
        run: regenerate::regenerate_section,
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub page: Option<String>,
    #[serde(rename = "rowCount")]
    pub row_count: Option<i64>,
    #[serde(rename = "runtimeStatus")]
    pub runtime_status: RuntimeStatus,
    #[serde(rename = "createdTime")]
    pub created_time: Option<String>,
}

/// Entry point for every external operation on runs.
#[derive(Clone)]
pub struct CampaignApi {
    engine: Arc<Engine>,
}

impl CampaignApi {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start (or attach to) a campaign run. The caller drives the returned
    /// instance with [`Engine::run_instance`].
    ///
    /// # Errors
    /// Returns a validation rejection for a bad page or run id, or an engine
    /// error when the history store fails.
    pub fn start_run(&self, request: &campaign::StartRequest) -> Result<StartOutcome, ApiError> {
        campaign::start_run(&self.engine, request)
    }

    /// # Errors
    /// Returns `NotFound` when neither the engine nor the ledger knows the run.
    pub fn status(&self, run_id: &str) -> Result<status::StatusView, ApiError> {
        ensure_non_empty("runId", run_id)?;
        status::get_status(&self.engine, run_id)?
            .ok_or_else(|| CampaignError::NotFound(format!("run {run_id}")).into())
    }

    /// # Errors
    /// Returns a validation rejection for a missing run id, unknown section
    /// or tone, before any instance starts.
    pub fn regenerate(
        &self,
        run_id: Option<&str>,
        section: Option<&str>,
        tone: Option<&str>,
    ) -> Result<StartOutcome, ApiError> {
        let request = regenerate::RegenerateRequest::parse(run_id, section, tone)
            .map_err(CampaignError::from)?;
        Ok(regenerate::start_regeneration(&self.engine, &request)?)
    }

    /// Raw bytes of one run artifact. `kind` defaults to the campaign. Runs
    /// the engine knows are read at their recorded prefix; others are found
    /// by discovery.
    ///
    /// # Errors
    /// Returns validation errors for a bad kind, `Configuration` without an
    /// artifact store and `NotFound` when the artifact is not written yet.
    pub fn fetch(&self, run_id: &str, kind: Option<&str>) -> Result<Vec<u8>, ApiError> {
        ensure_non_empty("runId", run_id)?;
        let kind = match kind.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => ArtifactKind::parse(raw).ok_or_else(|| {
                CampaignError::Validation(format!(
                    "file must be one of campaign, evidence, status, json; got {raw}"
                ))
            })?,
            None => ArtifactKind::Campaign,
        };
        let store = self.artifact_store()?;
        let prefix = self.recorded_prefix(run_id)?;
        let location = prefix
            .as_ref()
            .map_or(RunLocation::Discover(run_id), RunLocation::Known);
        fetch_artifact(store, location, kind)
            .map_err(storage_error)?
            .ok_or_else(|| {
                CampaignError::NotFound(format!("{} for run {run_id}", kind.file_name())).into()
            })
    }

    /// Markdown campaign pack for a run.
    ///
    /// # Errors
    /// Same conditions as [`CampaignApi::fetch`] for the campaign artifact.
    pub fn export(&self, run_id: &str) -> Result<String, ApiError> {
        ensure_non_empty("runId", run_id)?;
        let store = self.artifact_store()?;
        let prefix = self.recorded_prefix(run_id)?;
        let location = prefix
            .as_ref()
            .map_or(RunLocation::Discover(run_id), RunLocation::Known);
        export::export_run(store, location)
            .map_err(|err| match err.downcast::<CampaignError>() {
                Ok(campaign) => ApiError::Rejected(campaign),
                Err(other) => storage_error(other),
            })?
            .ok_or_else(|| CampaignError::NotFound(format!("campaign.json for run {run_id}")).into())
    }

    /// Newest campaign runs first.
    ///
    /// # Errors
    /// Returns an engine error when the history store fails.
    pub fn list_runs(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, ApiError> {
        let limit = limit
            .filter(|value| *value > 0)
            .unwrap_or(self.engine.config().runs_list_limit);
        let records = self
            .engine
            .list_instances(Some(campaign::ORCHESTRATION_NAME), limit)?;
        Ok(records.iter().map(run_summary).collect())
    }

    /// # Errors
    /// Returns `NotFound` for unknown runs.
    pub fn terminate(&self, run_id: &str, reason: Option<&str>) -> Result<bool, ApiError> {
        ensure_non_empty("runId", run_id)?;
        if self.engine.get_instance(run_id)?.is_none() {
            return Err(CampaignError::NotFound(format!("run {run_id}")).into());
        }
        let reason = reason
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("terminated by request");
        Ok(self.engine.terminate(run_id, reason)?)
    }

    fn recorded_prefix(&self, run_id: &str) -> Result<Option<RunPrefix>, ApiError> {
        Ok(self
            .engine
            .get_instance(run_id)?
            .as_ref()
            .and_then(campaign::recorded_prefix))
    }

    fn artifact_store(&self) -> Result<&dyn ArtifactStore, ApiError> {
        self.engine.env().artifacts().map_err(|err| {
            ApiError::Rejected(CampaignError::Configuration(err.message().to_string()))
        })
    }
}

fn run_summary(record: &InstanceRecord) -> RunSummary {
    let input: Option<RunInput> = serde_json::from_value(record.input.clone()).ok();
    RunSummary {
        run_id: record.instance_id.clone(),
        page: input.as_ref().map(|value| value.page.clone()),
        row_count: input.as_ref().map(|value| value.row_count),
        runtime_status: record.runtime_status,
        created_time: status::format_time(record.created_time),
    }
}
