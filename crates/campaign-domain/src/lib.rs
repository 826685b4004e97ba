#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub type DateTimeUtc = OffsetDateTime;

/// Fixed root under which every run's artifacts live.
pub const RESULTS_ROOT: &str = "results/campaign/";

pub const DEFAULT_PAGE: &str = "default";

pub const IGNORED_COLUMNS: [&str; 2] = ["AdopterProfile", "TopConnectivity"];

const MAX_INSTANCE_ID_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CampaignError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Stage {
    ValidatingInput,
    EvidenceBuilder,
    DraftCampaign,
    QualityGate,
    Completed,
    Failed,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidatingInput => "ValidatingInput",
            Self::EvidenceBuilder => "EvidenceBuilder",
            Self::DraftCampaign => "DraftCampaign",
            Self::QualityGate => "QualityGate",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ValidatingInput" => Some(Self::ValidatingInput),
            "EvidenceBuilder" => Some(Self::EvidenceBuilder),
            "DraftCampaign" => Some(Self::DraftCampaign),
            "QualityGate" => Some(Self::QualityGate),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime status reported by the durable-execution engine for one instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RuntimeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Coarse stage guess used only when no stage record has been written yet.
    /// The engine cannot tell which in-flight stage is active, so every
    /// running instance maps to `DraftCampaign`.
    #[must_use]
    pub fn coarse_stage(self) -> Stage {
        match self {
            Self::Pending => Stage::ValidatingInput,
            Self::Running => Stage::DraftCampaign,
            Self::Completed => Stage::Completed,
            Self::Failed | Self::Terminated => Stage::Failed,
        }
    }
}

impl Display for RuntimeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunInput {
    pub page: String,
    #[serde(rename = "rowCount")]
    pub row_count: i64,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub csv_sha256: Option<String>,
    #[serde(default)]
    pub company: Option<Value>,
}

impl RunInput {
    /// Build a run input, applying the defaults for a missing page or row count.
    #[must_use]
    pub fn normalized(
        page: Option<&str>,
        row_count: Option<i64>,
        filters: Option<Value>,
        csv_sha256: Option<String>,
        company: Option<Value>,
    ) -> Self {
        let page = page
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PAGE)
            .to_string();
        Self {
            page,
            row_count: row_count.unwrap_or(0),
            filters: filters.filter(|value| !value.is_null()),
            csv_sha256: csv_sha256.filter(|value| !value.trim().is_empty()),
            company: company.filter(|value| !value.is_null()),
        }
    }

    #[must_use]
    pub fn summary(&self) -> InputSummary {
        InputSummary {
            row_count: self.row_count,
            page: self.page.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InputSummary {
    #[serde(rename = "rowCount")]
    pub row_count: i64,
    pub page: String,
}

/// Status ledger entry persisted as `{prefix}status.json`. Overwritten on
/// every stage boundary; it never accumulates history.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StageRecord {
    #[serde(rename = "runId", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(rename = "state")]
    pub stage: Stage,
    #[serde(rename = "input", default, skip_serializing_if = "Option::is_none")]
    pub input_summary: Option<InputSummary>,
}

impl StageRecord {
    #[must_use]
    pub fn new(run_id: &str, stage: Stage, input_summary: InputSummary) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            stage,
            input_summary: Some(input_summary),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EvidenceItem {
    pub id: String,
    pub publisher: String,
    pub title: String,
    pub date: String,
    pub url: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputProof {
    pub run_id: String,
    pub csv_sha256: String,
    pub row_count: i64,
    pub filters: Option<Value>,
    pub filters_sha256: Option<String>,
    pub ignored_columns_confirmed: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LandingSection {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LandingPage {
    pub headline: String,
    pub subheadline: String,
    pub sections: Vec<LandingSection>,
    pub cta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EmailDraft {
    pub subject: String,
    pub preview: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SalesEnablement {
    pub call_script: String,
    pub one_pager: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CampaignMeta {
    pub tone_profile: String,
    pub persona_focus: String,
    pub evidence_window_months: u32,
    pub compliance_footer: bool,
}

/// The composed campaign document persisted as `{prefix}campaign.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignArtifact {
    pub executive_summary: String,
    pub landing_page: LandingPage,
    pub emails: Vec<EmailDraft>,
    pub sales_enablement: SalesEnablement,
    pub evidence_log: Vec<EvidenceItem>,
    pub input_proof: InputProof,
    pub meta: CampaignMeta,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Landing,
    Emails,
    Sales,
    Overview,
}

impl Section {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Landing => "landing",
            Self::Emails => "emails",
            Self::Sales => "sales",
            Self::Overview => "overview",
        }
    }

    /// Case-insensitive; surrounding whitespace is ignored.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "landing" => Some(Self::Landing),
            "emails" => Some(Self::Emails),
            "sales" => Some(Self::Sales),
            "overview" => Some(Self::Overview),
            _ => None,
        }
    }

    /// Top-level key of the campaign artifact owned by this section.
    #[must_use]
    pub fn artifact_key(self) -> &'static str {
        match self {
            Self::Landing => "landing_page",
            Self::Emails => "emails",
            Self::Sales => "sales_enablement",
            Self::Overview => "executive_summary",
        }
    }
}

impl Display for Section {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Match,
    Professional,
    Warm,
}

impl Tone {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Professional => "professional",
            Self::Warm => "warm",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "match" => Some(Self::Match),
            "professional" => Some(Self::Professional),
            "warm" => Some(Self::Warm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Campaign,
    Evidence,
    Status,
}

impl ArtifactKind {
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Campaign => "campaign.json",
            Self::Evidence => "evidence_log.json",
            Self::Status => "status.json",
        }
    }

    /// `json` is accepted as an alias for `campaign`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "campaign" | "json" => Some(Self::Campaign),
            "evidence" => Some(Self::Evidence),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// Deterministic storage root for one run:
/// `results/campaign/{page}/{yyyy}/{mm}/{dd}/{run_id}/`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct RunPrefix {
    pub page: String,
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub run_id: String,
}

impl RunPrefix {
    /// Derive the prefix from the orchestration's logical time. Callers must
    /// pass the context-provided time, never a fresh wall-clock reading.
    #[must_use]
    pub fn new(page: &str, run_id: &str, logical_time: DateTimeUtc) -> Self {
        Self {
            page: page.to_string(),
            year: logical_time.year(),
            month: u8::from(logical_time.month()),
            day: logical_time.day(),
            run_id: run_id.to_string(),
        }
    }

    /// Parse a prefix previously produced by [`RunPrefix::new`] or
    /// recovered from a discovered artifact path.
    ///
    /// # Errors
    /// Returns a validation error when the value does not follow the
    /// `results/campaign/{page}/{yyyy}/{mm}/{dd}/{run_id}/` convention.
    pub fn parse(value: &str) -> Result<Self, CampaignError> {
        let rest = value.strip_prefix(RESULTS_ROOT).ok_or_else(|| {
            CampaignError::Validation(format!("prefix must start with {RESULTS_ROOT}: {value}"))
        })?;
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        let [page, year, month, day, run_id] = segments.as_slice() else {
            return Err(CampaignError::Validation(format!(
                "prefix must have page/yyyy/mm/dd/run_id segments: {value}"
            )));
        };

        let year = parse_date_segment::<i32>("year", year, 4)?;
        let month = parse_date_segment::<u8>("month", month, 2)?;
        let day = parse_date_segment::<u8>("day", day, 2)?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(CampaignError::Validation(format!(
                "prefix carries an impossible date: {value}"
            )));
        }
        validate_path_segment("page", page)?;
        validate_path_segment("run_id", run_id)?;

        Ok(Self {
            page: (*page).to_string(),
            year,
            month,
            day,
            run_id: (*run_id).to_string(),
        })
    }

    #[must_use]
    pub fn artifact_path(&self, kind: ArtifactKind) -> String {
        format!("{self}{}", kind.file_name())
    }

    /// `yyyy-mm-dd` form of the prefix date.
    #[must_use]
    pub fn date_string(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

impl Display for RunPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{RESULTS_ROOT}{}/{:04}/{:02}/{:02}/{}/",
            self.page, self.year, self.month, self.day, self.run_id
        )
    }
}

fn parse_date_segment<T: std::str::FromStr>(
    field: &str,
    value: &str,
    width: usize,
) -> Result<T, CampaignError> {
    if value.len() != width || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(CampaignError::Validation(format!(
            "prefix {field} segment must be {width} digits: {value}"
        )));
    }
    value
        .parse::<T>()
        .map_err(|_| CampaignError::Validation(format!("invalid prefix {field}: {value}")))
}

/// Suffix every artifact of `run_id` ends with, used by discovery scans.
#[must_use]
pub fn artifact_suffix(run_id: &str, kind: ArtifactKind) -> String {
    format!("/{run_id}/{}", kind.file_name())
}

/// Deterministic identity of the regeneration instance for one run section.
#[must_use]
pub fn regeneration_instance_id(run_id: &str, section: Section) -> String {
    format!("{run_id}-regen-{}", section.as_str())
}

/// Ensure a value can be used as a single storage path segment.
///
/// # Errors
/// Returns a validation error when the value is empty, too long, a dot
/// segment, or contains characters outside `[A-Za-z0-9_.-]`.
pub fn validate_path_segment(field_name: &str, value: &str) -> Result<(), CampaignError> {
    if value.is_empty() {
        return Err(CampaignError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    if value.len() > MAX_INSTANCE_ID_LEN {
        return Err(CampaignError::Validation(format!(
            "{field_name} MUST be at most {MAX_INSTANCE_ID_LEN} characters"
        )));
    }
    if value == "." || value == ".." {
        return Err(CampaignError::Validation(format!(
            "{field_name} MUST NOT be a dot segment"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')))
    {
        return Err(CampaignError::Validation(format!(
            "{field_name} contains unsupported character {bad:?}"
        )));
    }
    Ok(())
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns a validation error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), CampaignError> {
    if value.trim().is_empty() {
        return Err(CampaignError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|byte| byte.is_ascii_hexdigit())
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical JSON form of `value`: object keys sorted at
/// every depth, compact separators. Key order in the input does not matter.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&canonical_json(value))?;
    Ok(hash_bytes(&bytes))
}

fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, item)| (key, canonical_json(item)))
                .collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, item)| (key.clone(), item))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Render a JSON document the way every artifact is persisted: two-space
/// indentation, insertion-ordered keys, trailing newline-free.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn to_artifact_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(value)
}
