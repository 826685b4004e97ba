//! Status queries: the engine's view of a run merged with the status ledger.

use campaign_artifacts::{read_stage, RunLocation};
use campaign_domain::{DateTimeUtc, InputSummary, RunInput, RuntimeStatus, Stage, StageRecord};
use campaign_history_core::InstanceRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use crate::{campaign, Engine, EngineError};

/// What the execution engine knows about one campaign instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub runtime_status: RuntimeStatus,
    pub custom_status: Option<Value>,
    pub created_time: DateTimeUtc,
    pub last_updated_time: DateTimeUtc,
    pub input: Option<InputSummary>,
    pub output: Option<Value>,
}

impl EngineStatus {
    #[must_use]
    pub fn from_instance(record: &InstanceRecord) -> Self {
        let input = serde_json::from_value::<RunInput>(record.input.clone())
            .ok()
            .map(|input| input.summary());
        Self {
            runtime_status: record.runtime_status,
            custom_status: record.custom_status.clone(),
            created_time: record.created_time,
            last_updated_time: record.last_updated_time,
            input,
            output: record.output.clone(),
        }
    }

    /// Best stage guess from the engine alone. Finished instances use the
    /// coarse runtime mapping. A live instance reports the non-terminal
    /// stage its orchestration last published as custom status, and falls
    /// back to the coarse mapping (`Pending` as `ValidatingInput`, `Running`
    /// as `DraftCampaign`) when it has published none.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self.runtime_status {
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated => {
                self.runtime_status.coarse_stage()
            }
            RuntimeStatus::Pending | RuntimeStatus::Running => self
                .custom_status
                .as_ref()
                .and_then(|status| status.get("state"))
                .and_then(Value::as_str)
                .and_then(Stage::parse)
                .filter(|stage| !stage.is_terminal())
                .unwrap_or_else(|| self.runtime_status.coarse_stage()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeView {
    #[serde(rename = "runtimeStatus")]
    pub runtime_status: Option<RuntimeStatus>,
    #[serde(rename = "customStatus")]
    pub custom_status: Option<Value>,
    #[serde(rename = "createdTime")]
    pub created_time: Option<String>,
    #[serde(rename = "lastUpdatedTime")]
    pub last_updated_time: Option<String>,
}

/// Canonical status payload returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusView {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub state: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub runtime: RuntimeView,
}

#[must_use]
pub fn format_time(value: DateTimeUtc) -> Option<String> {
    value.format(&Rfc3339).ok()
}

/// Merge both sources. A ledger record's stage always wins; without one the
/// engine's guess is used; with neither the run is unknown.
#[must_use]
pub fn merge_status(
    run_id: &str,
    engine: Option<&EngineStatus>,
    ledger: Option<&StageRecord>,
) -> Option<StatusView> {
    let state = match (ledger, engine) {
        (Some(record), _) => record.stage,
        (None, Some(status)) => status.stage(),
        (None, None) => return None,
    };

    let input = ledger
        .and_then(|record| record.input_summary.clone())
        .or_else(|| engine.and_then(|status| status.input.clone()));

    let result = if state == Stage::Completed {
        engine
            .filter(|status| status.runtime_status == RuntimeStatus::Completed)
            .and_then(|status| status.output.clone())
    } else {
        None
    };

    let runtime = engine.map_or_else(RuntimeView::default, |status| RuntimeView {
        runtime_status: Some(status.runtime_status),
        custom_status: status.custom_status.clone(),
        created_time: format_time(status.created_time),
        last_updated_time: format_time(status.last_updated_time),
    });

    Some(StatusView {
        run_id: run_id.to_string(),
        state,
        input,
        result,
        runtime,
    })
}

/// Status of a campaign run. The ledger is read at the prefix recomputed
/// from the engine record, so a restarted run never reports a ledger left
/// by an earlier generation; runs the engine does not know are found by
/// discovery. Without a ledger record the stage comes from
/// [`EngineStatus::stage`], which refines the coarse runtime mapping with
/// the live custom status. Ledger problems degrade to an engine-only
/// answer.
///
/// # Errors
/// Returns an error when the history store fails.
pub fn get_status(engine: &Engine, run_id: &str) -> Result<Option<StatusView>, EngineError> {
    let record = engine
        .get_instance(run_id)?
        .filter(|record| record.orchestration == campaign::ORCHESTRATION_NAME);
    let engine_status = record.as_ref().map(EngineStatus::from_instance);
    let prefix = record.as_ref().and_then(campaign::recorded_prefix);
    let location = prefix
        .as_ref()
        .map_or(RunLocation::Discover(run_id), RunLocation::Known);

    let ledger = match engine.env().artifacts() {
        Ok(store) => match read_stage(store, location) {
            Ok(record) => record,
            Err(err) => {
                warn!(run_id, error = %format!("{err:#}"), "status ledger unreadable; using engine status");
                None
            }
        },
        Err(err) => {
            debug!(run_id, error = %err, "no artifact store; using engine status");
            None
        }
    };

    Ok(merge_status(run_id, engine_status.as_ref(), ledger.as_ref()))
}
