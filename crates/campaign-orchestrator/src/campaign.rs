//! The campaign run orchestration and its four stage activities.

use campaign_artifacts::{put_json, write_stage, ArtifactStore};
use campaign_content::{DraftRequest, EvidenceRequest};
use campaign_domain::{
    hash_json, is_sha256_hex, validate_path_segment, ArtifactKind, CampaignArtifact,
    CampaignError, EvidenceItem, InputProof, InputSummary, RunInput, RunPrefix, Stage,
    IGNORED_COLUMNS,
};
use campaign_history_core::{FailureDetails, InstanceRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    ActivityEnv, ActivityError, ApiError, Engine, EngineError, OrchestrationContext, ReusePolicy,
    StartOutcome,
};

pub const ORCHESTRATION_NAME: &str = "CampaignOrchestration";

pub const VALIDATE_INPUT: &str = "validate_input";
pub const EVIDENCE_BUILDER: &str = "evidence_builder";
pub const CAMPAIGN_DRAFT: &str = "campaign_draft";
pub const VALIDATOR: &str = "validator";

const UNKNOWN_CSV_SHA256: &str = "unknown";

/// Body of a start request. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StartRequest {
    #[serde(rename = "runId", default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(rename = "rowCount", default)]
    pub row_count: Option<i64>,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub csv_sha256: Option<String>,
    #[serde(default)]
    pub company: Option<Value>,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StartRejection {
    #[error("page must be a single path segment: {0}")]
    InvalidPage(String),
    #[error("runId is not a valid run identity: {0}")]
    InvalidRunId(String),
}

impl From<StartRejection> for CampaignError {
    fn from(value: StartRejection) -> Self {
        Self::Validation(value.to_string())
    }
}

impl StartRequest {
    fn run_input(&self) -> Result<RunInput, StartRejection> {
        let input = RunInput::normalized(
            self.page.as_deref(),
            self.row_count,
            self.filters.clone(),
            self.csv_sha256.clone(),
            self.company.clone(),
        );
        validate_path_segment("page", &input.page)
            .map_err(|err| StartRejection::InvalidPage(err.to_string()))?;
        Ok(input)
    }

    fn requested_run_id(&self) -> Result<Option<&str>, StartRejection> {
        let Some(run_id) = self
            .run_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Ok(None);
        };
        validate_path_segment("runId", run_id)
            .map_err(|err| StartRejection::InvalidRunId(err.to_string()))?;
        Ok(Some(run_id))
    }
}

/// Validate and normalize a start request, then create the run instance or
/// attach to the existing one with the same run id.
///
/// # Errors
/// Returns a validation rejection before any instance exists, or an engine
/// error when the history store fails.
pub fn start_run(engine: &Engine, request: &StartRequest) -> Result<StartOutcome, ApiError> {
    let input = request.run_input().map_err(CampaignError::from)?;
    let run_id = request.requested_run_id().map_err(CampaignError::from)?;
    let value =
        serde_json::to_value(&input).map_err(|err| EngineError::InvalidInput(err.to_string()))?;

    let outcome = engine.start_new(ORCHESTRATION_NAME, run_id, value, ReusePolicy::AttachUnlessFailed)?;
    info!(
        run_id = %outcome.instance_id,
        page = %input.page,
        row_count = input.row_count,
        disposition = ?outcome.disposition,
        "campaign run accepted"
    );
    Ok(outcome)
}

/// Orchestration body. Deterministic: identity and time come from the
/// context, and each stage sees only what earlier activities returned.
///
/// # Errors
/// Any activity failure fails the run; see [`OrchestrationContext`].
pub fn run_campaign(ctx: &mut OrchestrationContext<'_>, input: Value) -> Result<Value, EngineError> {
    let input: RunInput = serde_json::from_value(input)
        .map_err(|err| EngineError::InvalidInput(format!("campaign input: {err}")))?;
    let run_id = ctx.instance_id().to_string();
    let prefix = RunPrefix::new(&input.page, &run_id, ctx.current_utc_datetime()).to_string();
    let retry = ctx.retry_policy().clone();

    if !ctx.is_replaying() {
        info!(%run_id, %prefix, "campaign run started");
    }

    ctx.set_custom_status(&stage_status(Stage::ValidatingInput, &run_id))?;
    let validated = ctx.call_activity_with_retry(
        VALIDATE_INPUT,
        json!({
            "prefix": prefix,
            "run_id": run_id,
            "page": input.page,
            "row_count": input.row_count,
            "filters": input.filters,
            "csv_sha256": input.csv_sha256,
            "company": input.company,
        }),
        &retry,
    )?;
    let input_proof = validated.get("input_proof").cloned().unwrap_or(Value::Null);

    ctx.set_custom_status(&stage_status(Stage::EvidenceBuilder, &run_id))?;
    let evidence = ctx.call_activity_with_retry(
        EVIDENCE_BUILDER,
        json!({
            "prefix": prefix,
            "run_id": run_id,
            "page": input.page,
            "row_count": input.row_count,
            "company": input.company,
        }),
        &retry,
    )?;
    let evidence_log = evidence
        .get("evidence_log")
        .cloned()
        .unwrap_or_else(|| json!([]));

    ctx.set_custom_status(&stage_status(Stage::DraftCampaign, &run_id))?;
    ctx.call_activity_with_retry(
        CAMPAIGN_DRAFT,
        json!({
            "prefix": prefix,
            "run_id": run_id,
            "page": input.page,
            "row_count": input.row_count,
            "evidence_log": evidence_log,
            "filters": input.filters,
            "csv_sha256": input.csv_sha256,
            "company": input.company,
            "input_proof": input_proof,
        }),
        &retry,
    )?;

    ctx.set_custom_status(&stage_status(Stage::QualityGate, &run_id))?;
    let result = ctx.call_activity_with_retry(
        VALIDATOR,
        json!({
            "prefix": prefix,
            "run_id": run_id,
            "page": input.page,
            "row_count": input.row_count,
            "company": input.company,
        }),
        &retry,
    )?;

    ctx.set_custom_status(&stage_status(Stage::Completed, &run_id))?;
    if !ctx.is_replaying() {
        info!(%run_id, "campaign run completed");
    }
    Ok(json!({"runId": run_id, "prefix": prefix, "result": result}))
}

fn stage_status(stage: Stage, run_id: &str) -> Value {
    json!({"state": stage.as_str(), "runId": run_id})
}

/// Common activity input. `prefix`, `run_id` and `page` are required.
#[derive(Debug, Clone, Deserialize)]
struct StageInput {
    prefix: String,
    run_id: String,
    page: String,
    #[serde(default)]
    row_count: i64,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    csv_sha256: Option<String>,
    #[serde(default)]
    company: Option<Value>,
    #[serde(default)]
    evidence_log: Option<Vec<EvidenceItem>>,
    #[serde(default)]
    input_proof: Option<InputProof>,
}

impl StageInput {
    fn parse(input: &Value) -> Result<(Self, RunPrefix), ActivityError> {
        let stage: Self = serde_json::from_value(input.clone())
            .map_err(|err| ActivityError::InvalidInput(format!("stage input: {err}")))?;
        for (field, value) in [
            ("prefix", &stage.prefix),
            ("run_id", &stage.run_id),
            ("page", &stage.page),
        ] {
            if value.trim().is_empty() {
                return Err(ActivityError::InvalidInput(format!("{field} is required")));
            }
        }
        let prefix = RunPrefix::parse(&stage.prefix)
            .map_err(|err| ActivityError::InvalidInput(err.to_string()))?;
        if prefix.run_id != stage.run_id {
            return Err(ActivityError::InvalidInput(format!(
                "prefix {} does not belong to run {}",
                stage.prefix, stage.run_id
            )));
        }
        Ok((stage, prefix))
    }

    fn summary(&self) -> InputSummary {
        InputSummary {
            row_count: self.row_count,
            page: self.page.clone(),
        }
    }
}

pub(crate) fn storage_failure(err: anyhow::Error) -> ActivityError {
    ActivityError::Failed(format!("artifact store: {err:#}"))
}

fn record_stage(
    store: &dyn ArtifactStore,
    prefix: &RunPrefix,
    stage: Stage,
    summary: InputSummary,
) -> Result<(), ActivityError> {
    write_stage(store, prefix, stage, summary).map_err(storage_failure)
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, ActivityError> {
    serde_json::to_value(value).map_err(|err| ActivityError::Failed(err.to_string()))
}

/// Proof of what the run was asked to process. Content problems become
/// warnings; nothing here fails the run.
#[must_use]
pub fn build_input_proof(
    run_id: &str,
    row_count: i64,
    filters: Option<&Value>,
    csv_sha256: Option<&str>,
) -> InputProof {
    let mut warnings = Vec::new();

    let csv_sha256 = match csv_sha256.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => {
            if !is_sha256_hex(value) {
                warnings.push(format!("csv_sha256 is not a 64-character hex digest: {value}"));
            }
            value.to_string()
        }
        None => UNKNOWN_CSV_SHA256.to_string(),
    };

    if row_count == 0 {
        warnings.push("rowCount is 0".to_string());
    } else if row_count < 0 {
        warnings.push(format!("rowCount is negative: {row_count}"));
    }

    let filters = filters.filter(|value| !value.is_null());
    if let Some(value) = filters {
        if !value.is_object() {
            warnings.push("filters is not an object".to_string());
        }
    }

    InputProof {
        run_id: run_id.to_string(),
        csv_sha256,
        row_count,
        filters: filters.cloned(),
        filters_sha256: filters.and_then(|value| hash_json(value).ok()),
        ignored_columns_confirmed: IGNORED_COLUMNS.iter().map(ToString::to_string).collect(),
        warnings,
    }
}

/// Stage 1: record `ValidatingInput` and return the input proof.
///
/// # Errors
/// `InvalidInput` when required fields are missing, `Configuration` without
/// an artifact store, `Failed` when the ledger write fails.
pub fn validate_input(env: &ActivityEnv, input: &Value) -> Result<Value, ActivityError> {
    let (stage, prefix) = StageInput::parse(input)?;
    let store = env.artifacts()?;
    record_stage(store, &prefix, Stage::ValidatingInput, stage.summary())?;

    let proof = build_input_proof(
        &stage.run_id,
        stage.row_count,
        stage.filters.as_ref(),
        stage.csv_sha256.as_deref(),
    );
    if !proof.warnings.is_empty() {
        warn!(run_id = %stage.run_id, warnings = ?proof.warnings, "run input has warnings");
    }
    Ok(json!({"input_proof": to_result(&proof)?}))
}

/// Stage 2: collect evidence dated by the run's prefix and persist it.
///
/// # Errors
/// See [`validate_input`]; evidence source failures are `Failed`.
pub fn evidence_builder(env: &ActivityEnv, input: &Value) -> Result<Value, ActivityError> {
    let (stage, prefix) = StageInput::parse(input)?;
    let store = env.artifacts()?;
    record_stage(store, &prefix, Stage::EvidenceBuilder, stage.summary())?;

    let as_of_date = prefix.date_string();
    let items = env
        .evidence
        .collect(&EvidenceRequest {
            run_id: &stage.run_id,
            page: &stage.page,
            row_count: stage.row_count,
            company: stage.company.as_ref(),
            as_of_date: &as_of_date,
        })
        .map_err(|err| ActivityError::Failed(format!("evidence source: {err:#}")))?;
    put_json(store, &prefix.artifact_path(ArtifactKind::Evidence), &items)
        .map_err(storage_failure)?;

    Ok(json!({"evidence_log": to_result(&items)?}))
}

/// Stage 3: compose and persist the campaign artifact.
///
/// # Errors
/// See [`validate_input`]; generator failures are `Failed`.
pub fn campaign_draft(env: &ActivityEnv, input: &Value) -> Result<Value, ActivityError> {
    let (stage, prefix) = StageInput::parse(input)?;
    let store = env.artifacts()?;
    record_stage(store, &prefix, Stage::DraftCampaign, stage.summary())?;

    let evidence_log = stage.evidence_log.clone().unwrap_or_default();
    let input_proof = stage.input_proof.clone().unwrap_or_else(|| {
        build_input_proof(
            &stage.run_id,
            stage.row_count,
            stage.filters.as_ref(),
            stage.csv_sha256.as_deref(),
        )
    });

    let draft = env
        .content
        .draft_campaign(&DraftRequest {
            run_id: &stage.run_id,
            page: &stage.page,
            row_count: stage.row_count,
            company: stage.company.as_ref(),
            evidence_log: &evidence_log,
        })
        .map_err(|err| {
            ActivityError::Failed(format!(
                "content generator {}: {err:#}",
                env.content.generator_name()
            ))
        })?;

    let artifact = CampaignArtifact {
        executive_summary: draft.executive_summary,
        landing_page: draft.landing_page,
        emails: draft.emails,
        sales_enablement: draft.sales_enablement,
        evidence_log,
        input_proof,
        meta: draft.meta,
    };
    let path = prefix.artifact_path(ArtifactKind::Campaign);
    put_json(store, &path, &artifact).map_err(storage_failure)?;

    Ok(json!({"campaign_path": path}))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QualityCheck {
    pub name: String,
    pub passed: bool,
}

impl QualityCheck {
    fn new(name: &str, passed: bool) -> Self {
        Self {
            name: name.to_string(),
            passed,
        }
    }
}

fn filled(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Contract checks the quality gate applies to a finished campaign.
#[must_use]
pub fn quality_checks(campaign: &CampaignArtifact, run_id: &str) -> Vec<QualityCheck> {
    vec![
        QualityCheck::new("headline_present", filled(&campaign.landing_page.headline)),
        QualityCheck::new("cta_present", filled(&campaign.landing_page.cta)),
        QualityCheck::new(
            "email_present",
            campaign
                .emails
                .iter()
                .any(|email| filled(&email.subject) && filled(&email.body)),
        ),
        QualityCheck::new("evidence_present", !campaign.evidence_log.is_empty()),
        QualityCheck::new("input_proof_matches_run", campaign.input_proof.run_id == run_id),
    ]
}

/// Stage 4: quality gate. Writes `QualityGate`, checks the persisted
/// campaign, then writes `Completed`.
///
/// # Errors
/// `NotFound` when the campaign artifact is missing and `QualityGate` when
/// it is unreadable or a check fails.
pub fn validator(env: &ActivityEnv, input: &Value) -> Result<Value, ActivityError> {
    let (stage, prefix) = StageInput::parse(input)?;
    let store = env.artifacts()?;
    record_stage(store, &prefix, Stage::QualityGate, stage.summary())?;

    let path = prefix.artifact_path(ArtifactKind::Campaign);
    let bytes = store
        .get(&path)
        .map_err(storage_failure)?
        .ok_or_else(|| ActivityError::NotFound(path.clone()))?;
    let campaign: CampaignArtifact = serde_json::from_slice(&bytes)
        .map_err(|err| ActivityError::QualityGate(format!("{path} is malformed: {err}")))?;

    let checks = quality_checks(&campaign, &stage.run_id);
    let failed: Vec<&str> = checks
        .iter()
        .filter(|check| !check.passed)
        .map(|check| check.name.as_str())
        .collect();
    if !failed.is_empty() {
        return Err(ActivityError::QualityGate(format!(
            "checks failed: {}",
            failed.join(", ")
        )));
    }

    record_stage(store, &prefix, Stage::Completed, stage.summary())?;
    Ok(json!({"ok": true, "checks": to_result(&checks)?}))
}

/// Prefix of a campaign run as its engine record places it: the input page
/// and the logical time of the record's current generation. `None` for
/// other orchestrations or an unreadable input.
#[must_use]
pub fn recorded_prefix(instance: &InstanceRecord) -> Option<RunPrefix> {
    if instance.orchestration != ORCHESTRATION_NAME {
        return None;
    }
    let input: RunInput = serde_json::from_value(instance.input.clone()).ok()?;
    Some(RunPrefix::new(
        &input.page,
        &instance.instance_id,
        instance.created_time,
    ))
}

/// Failure hook: a failed or terminated run must not keep a stage record
/// that implies progress.
///
/// # Errors
/// Returns an error when the instance input is unreadable, no artifact
/// store is configured, or the ledger write fails.
pub fn mark_run_failed(
    env: &ActivityEnv,
    instance: &InstanceRecord,
    failure: &FailureDetails,
) -> Result<(), ActivityError> {
    let input: RunInput = serde_json::from_value(instance.input.clone())
        .map_err(|err| ActivityError::InvalidInput(format!("campaign input: {err}")))?;
    let store = env.artifacts()?;
    let prefix = RunPrefix::new(&input.page, &instance.instance_id, instance.created_time);
    record_stage(store, &prefix, Stage::Failed, input.summary())?;
    warn!(
        run_id = %instance.instance_id,
        kind = %failure.kind,
        reason = %failure.message,
        "run marked failed in status ledger"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_proof_records_content_warnings() {
        let filters = json!(["not", "an", "object"]);
        let proof = build_input_proof("R1", 0, Some(&filters), Some("abc"));
        assert_eq!(proof.csv_sha256, "abc");
        assert_eq!(proof.warnings.len(), 3);
        assert!(proof.filters_sha256.is_some());
        assert_eq!(
            proof.ignored_columns_confirmed,
            vec!["AdopterProfile".to_string(), "TopConnectivity".to_string()]
        );
    }

    #[test]
    fn input_proof_defaults_missing_hash_to_unknown() {
        let proof = build_input_proof("R1", 120, None, None);
        assert_eq!(proof.csv_sha256, UNKNOWN_CSV_SHA256);
        assert!(proof.warnings.is_empty());
        assert_eq!(proof.filters_sha256, None);
    }

    #[test]
    fn start_request_rejects_nested_page() {
        let request = StartRequest {
            page: Some("a/b".to_string()),
            ..StartRequest::default()
        };
        assert!(matches!(
            request.run_input(),
            Err(StartRejection::InvalidPage(_))
        ));

        let request = StartRequest {
            run_id: Some("   ".to_string()),
            ..StartRequest::default()
        };
        assert_eq!(request.requested_run_id(), Ok(None));
        let request = StartRequest {
            run_id: Some("../x".to_string()),
            ..StartRequest::default()
        };
        assert!(request.requested_run_id().is_err());
    }

    #[test]
    fn stage_input_requires_prefix_run_and_page() {
        let missing = json!({"prefix": "", "run_id": "R1", "page": "p"});
        assert!(matches!(
            StageInput::parse(&missing),
            Err(ActivityError::InvalidInput(_))
        ));

        let foreign = json!({
            "prefix": "results/campaign/p/2025/01/01/OTHER/",
            "run_id": "R1",
            "page": "p",
        });
        assert!(matches!(
            StageInput::parse(&foreign),
            Err(ActivityError::InvalidInput(_))
        ));

        let ok = json!({
            "prefix": "results/campaign/p/2025/01/01/R1/",
            "run_id": "R1",
            "page": "p",
        });
        assert!(StageInput::parse(&ok).is_ok());
    }
}
