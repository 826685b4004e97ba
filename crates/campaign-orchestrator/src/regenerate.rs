//! Section regeneration: refresh one slice of a finished campaign under a
//! deterministic per-(run, section) instance identity.

use campaign_artifacts::discover_prefix;
use campaign_content::{SectionRequest, DEFAULT_TONE_PROFILE};
use campaign_domain::{
    regeneration_instance_id, to_artifact_bytes, validate_path_segment, ArtifactKind,
    CampaignError, EmailDraft, EvidenceItem, LandingPage, RunPrefix, SalesEnablement, Section,
    Tone,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::campaign::{self, storage_failure};
use crate::{
    ActivityEnv, ActivityError, Engine, EngineError, OrchestrationContext, ReusePolicy,
    StartOutcome,
};

pub const ORCHESTRATION_NAME: &str = "RegenerateSectionOrchestration";

pub const LOCATE_RUN: &str = "locate_run";
pub const REGENERATE_SECTION: &str = "regenerate_section";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegenerateRejection {
    #[error("runId is required")]
    MissingRunId,
    #[error("runId is not a valid run identity: {0}")]
    InvalidRunId(String),
    #[error("section is required (landing, emails, sales, overview)")]
    MissingSection,
    #[error("unknown section {0:?}; expected landing, emails, sales or overview")]
    UnknownSection(String),
    #[error("unknown tone {0:?}; expected match, professional or warm")]
    UnknownTone(String),
}

impl From<RegenerateRejection> for CampaignError {
    fn from(value: RegenerateRejection) -> Self {
        Self::Validation(value.to_string())
    }
}

/// A validated regeneration request. Also the orchestration input.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RegenerateRequest {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub section: Section,
    #[serde(default)]
    pub tone: Option<Tone>,
}

impl RegenerateRequest {
    /// # Errors
    /// Rejects a missing or malformed run id, and unknown sections or tones.
    pub fn parse(
        run_id: Option<&str>,
        section: Option<&str>,
        tone: Option<&str>,
    ) -> Result<Self, RegenerateRejection> {
        let run_id = run_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(RegenerateRejection::MissingRunId)?;
        let section_raw = section
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(RegenerateRejection::MissingSection)?;
        let section = Section::parse(section_raw)
            .ok_or_else(|| RegenerateRejection::UnknownSection(section_raw.to_string()))?;
        let tone = match tone.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => {
                Some(Tone::parse(raw).ok_or_else(|| RegenerateRejection::UnknownTone(raw.to_string()))?)
            }
            None => None,
        };

        validate_path_segment("runId", run_id)
            .and_then(|()| {
                validate_path_segment("instanceId", &regeneration_instance_id(run_id, section))
            })
            .map_err(|err| RegenerateRejection::InvalidRunId(err.to_string()))?;

        Ok(Self {
            run_id: run_id.to_string(),
            section,
            tone,
        })
    }

    #[must_use]
    pub fn instance_id(&self) -> String {
        regeneration_instance_id(&self.run_id, self.section)
    }
}

/// Orchestration input: the request plus the run's prefix when the engine
/// has a record of the run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct RegenerationInput {
    #[serde(flatten)]
    request: RegenerateRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
}

/// Start the regeneration instance for the request's (run, section) pair,
/// or attach to the one already in flight.
///
/// # Errors
/// Returns an engine error when the history store fails.
pub fn start_regeneration(
    engine: &Engine,
    request: &RegenerateRequest,
) -> Result<StartOutcome, EngineError> {
    let instance_id = request.instance_id();
    let prefix = engine
        .get_instance(&request.run_id)?
        .as_ref()
        .and_then(campaign::recorded_prefix)
        .map(|prefix| prefix.to_string());
    let input = serde_json::to_value(RegenerationInput {
        request: request.clone(),
        prefix,
    })
    .map_err(|err| EngineError::InvalidInput(err.to_string()))?;
    let outcome = engine.start_new(
        ORCHESTRATION_NAME,
        Some(&instance_id),
        input,
        ReusePolicy::AttachWhileActive,
    )?;
    info!(
        run_id = %request.run_id,
        section = request.section.as_str(),
        instance_id = %outcome.instance_id,
        disposition = ?outcome.disposition,
        "section regeneration accepted"
    );
    Ok(outcome)
}

/// Orchestration body: locate the run's prefix, then refresh one section.
///
/// # Errors
/// Fails when the run cannot be located or the section refresh fails.
pub fn run_regeneration(
    ctx: &mut OrchestrationContext<'_>,
    input: Value,
) -> Result<Value, EngineError> {
    let RegenerationInput { request, prefix } = serde_json::from_value(input)
        .map_err(|err| EngineError::InvalidInput(format!("regeneration input: {err}")))?;
    let instance_id = ctx.instance_id().to_string();
    let retry = ctx.retry_policy().clone();

    if !ctx.is_replaying() {
        info!(%instance_id, run_id = %request.run_id, "section regeneration started");
    }

    let located = ctx.call_activity_with_retry(
        LOCATE_RUN,
        json!({"run_id": request.run_id, "prefix": prefix}),
        &retry,
    )?;
    let prefix = located
        .get("prefix")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidInput("locate_run returned no prefix".to_string()))?
        .to_string();

    ctx.set_custom_status(&json!({
        "state": "Regenerating",
        "runId": request.run_id,
        "section": request.section,
    }))?;
    let result = ctx.call_activity_with_retry(
        REGENERATE_SECTION,
        json!({
            "prefix": prefix,
            "run_id": request.run_id,
            "section": request.section,
            "tone": request.tone,
            "instance_id": instance_id,
        }),
        &retry,
    )?;

    ctx.set_custom_status(&json!({
        "state": "Completed",
        "runId": request.run_id,
        "section": request.section,
    }))?;
    Ok(json!({
        "instanceId": instance_id,
        "runId": request.run_id,
        "section": request.section,
        "result": result,
    }))
}

#[derive(Debug, Deserialize)]
struct LocateInput {
    run_id: String,
    #[serde(default)]
    prefix: Option<String>,
}

/// Resolve the run's prefix: the recorded one when the input carries it,
/// otherwise discovered from the campaign artifact.
///
/// # Errors
/// `NotFound` when the run has no campaign artifact at that prefix yet.
pub fn locate_run(env: &ActivityEnv, input: &Value) -> Result<Value, ActivityError> {
    let input: LocateInput = serde_json::from_value(input.clone())
        .map_err(|err| ActivityError::InvalidInput(format!("locate_run input: {err}")))?;
    if input.run_id.trim().is_empty() {
        return Err(ActivityError::InvalidInput("run_id is required".to_string()));
    }
    let store = env.artifacts()?;
    let missing = || ActivityError::NotFound(format!("campaign.json for run {}", input.run_id));

    let prefix = match input.prefix.as_deref() {
        Some(raw) => {
            let prefix = RunPrefix::parse(raw)
                .map_err(|err| ActivityError::InvalidInput(err.to_string()))?;
            if prefix.run_id != input.run_id {
                return Err(ActivityError::InvalidInput(format!(
                    "prefix {raw} does not belong to run {}",
                    input.run_id
                )));
            }
            store
                .get(&prefix.artifact_path(ArtifactKind::Campaign))
                .map_err(storage_failure)?
                .ok_or_else(missing)?;
            prefix
        }
        None => discover_prefix(store, &input.run_id)
            .map_err(storage_failure)?
            .ok_or_else(missing)?,
    };
    Ok(json!({"prefix": prefix.to_string()}))
}

#[derive(Debug, Deserialize)]
struct SectionInput {
    prefix: String,
    run_id: String,
    section: Section,
    #[serde(default)]
    tone: Option<Tone>,
    instance_id: String,
}

/// Tone profile a regeneration applies: explicit tones win, `match` or no
/// tone keep the campaign's current profile.
#[must_use]
pub fn resolve_tone(tone: Option<Tone>, campaign: &Value) -> String {
    match tone {
        Some(Tone::Professional) => Tone::Professional.as_str().to_string(),
        Some(Tone::Warm) => Tone::Warm.as_str().to_string(),
        Some(Tone::Match) | None => campaign
            .pointer("/meta/tone_profile")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_TONE_PROFILE)
            .to_string(),
    }
}

fn check_section_shape(section: Section, value: &Value) -> Result<(), ActivityError> {
    let malformed =
        |err: serde_json::Error| ActivityError::QualityGate(format!("{section} content: {err}"));
    match section {
        Section::Landing => {
            serde_json::from_value::<LandingPage>(value.clone()).map_err(malformed)?;
        }
        Section::Emails => {
            let emails: Vec<EmailDraft> =
                serde_json::from_value(value.clone()).map_err(malformed)?;
            if emails.is_empty() {
                return Err(ActivityError::QualityGate(
                    "emails content is empty".to_string(),
                ));
            }
        }
        Section::Sales => {
            serde_json::from_value::<SalesEnablement>(value.clone()).map_err(malformed)?;
        }
        Section::Overview => {
            if !value.as_str().is_some_and(|text| !text.trim().is_empty()) {
                return Err(ActivityError::QualityGate(
                    "overview content must be a non-empty string".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Replace the section's key and its `meta.regenerations` entry in a
/// campaign document, leaving every other key as it was.
///
/// # Errors
/// Returns an error when the document is not a JSON object.
pub fn splice_section(
    campaign: &mut Value,
    section: Section,
    content: Value,
    instance_id: &str,
    tone_profile: &str,
) -> anyhow::Result<()> {
    let Some(root) = campaign.as_object_mut() else {
        anyhow::bail!("campaign artifact is not a JSON object");
    };
    root.insert(section.artifact_key().to_string(), content);

    let meta = root
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(meta) = meta.as_object_mut() {
        let regenerations = meta
            .entry("regenerations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !regenerations.is_object() {
            *regenerations = Value::Object(Map::new());
        }
        if let Some(regenerations) = regenerations.as_object_mut() {
            regenerations.insert(
                section.as_str().to_string(),
                json!({"instance_id": instance_id, "tone": tone_profile}),
            );
        }
    }
    Ok(())
}

/// Generate fresh content for one section and splice it into the campaign
/// artifact with a single read-modify-write. The run's status record is
/// never touched.
///
/// # Errors
/// `NotFound` when the campaign artifact is missing, `QualityGate` when
/// the generated content has the wrong shape, `Failed` on generator or
/// storage failures.
pub fn regenerate_section(env: &ActivityEnv, input: &Value) -> Result<Value, ActivityError> {
    let input: SectionInput = serde_json::from_value(input.clone())
        .map_err(|err| ActivityError::InvalidInput(format!("regenerate_section input: {err}")))?;
    let prefix = RunPrefix::parse(&input.prefix)
        .map_err(|err| ActivityError::InvalidInput(err.to_string()))?;
    if prefix.run_id != input.run_id {
        return Err(ActivityError::InvalidInput(format!(
            "prefix {} does not belong to run {}",
            input.prefix, input.run_id
        )));
    }
    let store = env.artifacts()?;
    let path = prefix.artifact_path(ArtifactKind::Campaign);

    let bytes = store
        .get(&path)
        .map_err(storage_failure)?
        .ok_or_else(|| ActivityError::NotFound(path.clone()))?;
    let current: Value = serde_json::from_slice(&bytes)
        .map_err(|err| ActivityError::InvalidInput(format!("{path} is not valid JSON: {err}")))?;
    let evidence_log: Vec<EvidenceItem> = match current.get("evidence_log") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| ActivityError::InvalidInput(format!("{path} evidence_log: {err}")))?,
        None => Vec::new(),
    };
    let tone_profile = resolve_tone(input.tone, &current);

    let content = env
        .content
        .regenerate_section(&SectionRequest {
            run_id: &input.run_id,
            page: &prefix.page,
            section: input.section,
            tone_profile: &tone_profile,
            current: &current,
            evidence_log: &evidence_log,
        })
        .map_err(|err| {
            ActivityError::Failed(format!(
                "content generator {}: {err:#}",
                env.content.generator_name()
            ))
        })?;
    check_section_shape(input.section, &content)?;

    store
        .update(&path, &mut |existing| {
            let bytes = existing.ok_or_else(|| anyhow::anyhow!("{path} disappeared"))?;
            let mut campaign: Value = serde_json::from_slice(&bytes)?;
            splice_section(
                &mut campaign,
                input.section,
                content.clone(),
                &input.instance_id,
                &tone_profile,
            )?;
            Ok(to_artifact_bytes(&campaign)?)
        })
        .map_err(storage_failure)?;

    info!(
        run_id = %input.run_id,
        section = input.section.as_str(),
        tone = %tone_profile,
        "campaign section regenerated"
    );
    Ok(json!({
        "section": input.section,
        "artifact_key": input.section.artifact_key(),
        "tone": tone_profile,
        "path": path,
    }))
}
