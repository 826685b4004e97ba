#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use campaign_domain::{
    CampaignMeta, EmailDraft, EvidenceItem, LandingPage, LandingSection, SalesEnablement, Section,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_TONE_PROFILE: &str = "professional";

/// Inputs for a full campaign draft.
#[derive(Debug, Clone, Serialize)]
pub struct DraftRequest<'a> {
    pub run_id: &'a str,
    pub page: &'a str,
    pub row_count: i64,
    pub company: Option<&'a Value>,
    pub evidence_log: &'a [EvidenceItem],
}

/// Generated parts of a campaign. Evidence and input proof are attached by
/// the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignDraft {
    pub executive_summary: String,
    pub landing_page: LandingPage,
    pub emails: Vec<EmailDraft>,
    pub sales_enablement: SalesEnablement,
    pub meta: CampaignMeta,
}

/// Inputs for refreshing one section of an existing campaign.
#[derive(Debug, Clone, Serialize)]
pub struct SectionRequest<'a> {
    pub run_id: &'a str,
    pub page: &'a str,
    pub section: Section,
    /// Concrete tone profile; `match` has already been resolved by the caller.
    pub tone_profile: &'a str,
    pub current: &'a Value,
    pub evidence_log: &'a [EvidenceItem],
}

pub trait ContentGenerator: Send + Sync {
    fn generator_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn draft_campaign(&self, request: &DraftRequest<'_>) -> Result<CampaignDraft>;

    /// New JSON value for the section's slice of the campaign artifact.
    #[allow(clippy::missing_errors_doc)]
    fn regenerate_section(&self, request: &SectionRequest<'_>) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct EvidenceRequest<'a> {
    pub run_id: &'a str,
    pub page: &'a str,
    pub row_count: i64,
    pub company: Option<&'a Value>,
    /// `yyyy-mm-dd` of the run's logical start.
    pub as_of_date: &'a str,
}

pub trait EvidenceSource: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn collect(&self, request: &EvidenceRequest<'_>) -> Result<Vec<EvidenceItem>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticEvidenceSource;

impl EvidenceSource for StaticEvidenceSource {
    fn collect(&self, request: &EvidenceRequest<'_>) -> Result<Vec<EvidenceItem>> {
        Ok(vec![
            EvidenceItem {
                id: "ev-001".to_string(),
                publisher: "Ofcom".to_string(),
                title: "SME adoption trends 2025".to_string(),
                date: request.as_of_date.to_string(),
                url: "https://example.org/ofcom-sme-trends".to_string(),
                excerpt: "Indicators point to increased UC adoption among UK SMEs.".to_string(),
            },
            EvidenceItem {
                id: "ev-002".to_string(),
                publisher: "ONS".to_string(),
                title: "UK business demography highlights".to_string(),
                date: request.as_of_date.to_string(),
                url: "https://example.org/ons-business-demography".to_string(),
                excerpt: "Active enterprise growth centered in digital and services sectors."
                    .to_string(),
            },
        ])
    }
}

/// Deterministic generator: output is a pure function of the request.
#[derive(Debug, Clone)]
pub struct TemplateContentGenerator {
    template_version: String,
}

impl Default for TemplateContentGenerator {
    fn default() -> Self {
        Self {
            template_version: "template.v1".to_string(),
        }
    }
}

impl TemplateContentGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn deterministic_token(&self, parts: &[&str]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.template_version.as_bytes());
        hasher.finalize().into()
    }

    fn landing(&self, tone: ToneVoice, variant: usize) -> LandingPage {
        let headline = match (tone, variant % 2) {
            (ToneVoice::Professional, 0) => "Grow Faster with Inside Track",
            (ToneVoice::Professional, _) => "Win the Right UK Tech Buyers with Inside Track",
            (ToneVoice::Warm, 0) => "Let's Grow Your Pipeline Together",
            (ToneVoice::Warm, _) => "Find the Buyers Who Already Need You",
        };
        let (subheadline, value) = match tone {
            ToneVoice::Professional => (
                "Target the right UK tech buyers with evidence-led messaging.",
                "We find and prioritize the prospects most likely to buy, then arm your team with proof.",
            ),
            ToneVoice::Warm => (
                "We help you reach UK tech buyers with messages they actually want to read.",
                "We point you at the people most likely to say yes, and hand your team the proof to back it up.",
            ),
        };
        LandingPage {
            headline: headline.to_string(),
            subheadline: subheadline.to_string(),
            sections: vec![
                LandingSection {
                    title: "Value Proposition".to_string(),
                    content: Some(value.to_string()),
                    bullets: None,
                },
                LandingSection {
                    title: "Features".to_string(),
                    content: None,
                    bullets: Some(vec![
                        "Segment insights".to_string(),
                        "Evidence-led content".to_string(),
                        "Sales enablement toolkit".to_string(),
                    ]),
                },
            ],
            cta: match tone {
                ToneVoice::Professional => "Book a discovery call",
                ToneVoice::Warm => "Let's talk",
            }
            .to_string(),
        }
    }

    fn emails(&self, tone: ToneVoice, variant: usize) -> Vec<EmailDraft> {
        let greeting = match tone {
            ToneVoice::Professional => "Hi {{FirstName}},",
            ToneVoice::Warm => "Hi {{FirstName}}, hope your week is going well.",
        };
        let mut drafts = vec![
            EmailDraft {
                subject: "How UK tech sellers are winning share from the big telcos".to_string(),
                preview: "Quick intro to a data-backed approach to outreach.".to_string(),
                body: format!(
                    "{greeting}\n\nWe help UK tech providers win market share using evidence-led outreach..."
                ),
            },
            EmailDraft {
                subject: "A 6-month plan to increase response rates".to_string(),
                preview: "What changes when you use Inside Track evidence.".to_string(),
                body: format!(
                    "{greeting}\n\nHere's a simple plan to double-down on the segments most likely to engage..."
                ),
            },
        ];
        if variant % 2 == 1 {
            drafts.reverse();
        }
        drafts
    }

    fn sales(&self, tone: ToneVoice) -> SalesEnablement {
        match tone {
            ToneVoice::Professional => SalesEnablement {
                call_script: "OPENER -> CONTEXT -> PROOF -> ASK. Example: 'We work with UK tech firms who are shifting share from the telcos...'".to_string(),
                one_pager: "Inside Track overview: problem, approach, proof-points, outcomes, CTA.".to_string(),
            },
            ToneVoice::Warm => SalesEnablement {
                call_script: "Say hello, ask what is on their plate this quarter, share one proof-point, then suggest a next step together.".to_string(),
                one_pager: "Inside Track in one page: the problem we solve, how we work with you, and what customers saw.".to_string(),
            },
        }
    }

    fn summary(&self, page: &str, row_count: i64, evidence: usize, tone: ToneVoice) -> String {
        match tone {
            ToneVoice::Professional => format!(
                "Executive summary for page '{page}': {row_count} prospect rows analysed against {evidence} evidence sources."
            ),
            ToneVoice::Warm => format!(
                "Here is the picture for '{page}': we looked at {row_count} prospects and {evidence} trusted sources to find where you can win."
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ToneVoice {
    Professional,
    Warm,
}

impl ToneVoice {
    fn from_profile(profile: &str) -> Self {
        if profile.eq_ignore_ascii_case("warm") {
            Self::Warm
        } else {
            Self::Professional
        }
    }
}

fn variant(token: &[u8; 32]) -> usize {
    usize::from(token[0])
}

impl ContentGenerator for TemplateContentGenerator {
    fn generator_name(&self) -> &'static str {
        "template"
    }

    fn draft_campaign(&self, request: &DraftRequest<'_>) -> Result<CampaignDraft> {
        let tone = ToneVoice::Professional;
        Ok(CampaignDraft {
            executive_summary: self.summary(
                request.page,
                request.row_count,
                request.evidence_log.len(),
                tone,
            ),
            landing_page: self.landing(tone, 0),
            emails: self.emails(tone, 0),
            sales_enablement: self.sales(tone),
            meta: CampaignMeta {
                tone_profile: DEFAULT_TONE_PROFILE.to_string(),
                persona_focus: "UK tech decision-maker".to_string(),
                evidence_window_months: 6,
                compliance_footer: true,
            },
        })
    }

    fn regenerate_section(&self, request: &SectionRequest<'_>) -> Result<Value> {
        let tone = ToneVoice::from_profile(request.tone_profile);
        let token = self.deterministic_token(&[
            request.run_id,
            request.page,
            request.section.as_str(),
            request.tone_profile,
        ]);
        let pick = variant(&token);
        let value = match request.section {
            Section::Landing => serde_json::to_value(self.landing(tone, pick))?,
            Section::Emails => serde_json::to_value(self.emails(tone, pick))?,
            Section::Sales => serde_json::to_value(self.sales(tone))?,
            Section::Overview => {
                let row_count = request
                    .current
                    .pointer("/input_proof/row_count")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                Value::String(self.summary(
                    request.page,
                    row_count,
                    request.evidence_log.len(),
                    tone,
                ))
            }
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpJsonConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auth_bearer_token: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Delegates drafting to a remote JSON endpoint. The endpoint receives
/// `{operation, request}` and answers with the draft (or `{content}` for a
/// section refresh).
#[derive(Debug, Clone)]
pub struct HttpJsonContentGenerator {
    config: HttpJsonConfig,
    adapter_version: String,
}

impl HttpJsonContentGenerator {
    /// # Errors
    /// Returns an error when the endpoint URL is empty.
    pub fn new(config: HttpJsonConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(anyhow!("http_json content generator requires url"));
        }
        Ok(Self {
            config,
            adapter_version: "http_json.v1".to_string(),
        })
    }

    fn call(&self, operation: &str, request: Value) -> Result<Value> {
        let outbound = json!({
            "adapter_version": self.adapter_version,
            "operation": operation,
            "request": request,
        });

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();
        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json");
        if let Some(token) = &self.config.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(&outbound) {
            Ok(response) => response
                .into_json::<Value>()
                .context("content endpoint returned invalid JSON"),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("content endpoint {operation} failed: http status {code}"))
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!("http transport failure: {err}")),
        }
    }
}

impl ContentGenerator for HttpJsonContentGenerator {
    fn generator_name(&self) -> &'static str {
        "http_json"
    }

    fn draft_campaign(&self, request: &DraftRequest<'_>) -> Result<CampaignDraft> {
        let body = self.call("draft_campaign", serde_json::to_value(request)?)?;
        serde_json::from_value(body).context("content endpoint returned a malformed draft")
    }

    fn regenerate_section(&self, request: &SectionRequest<'_>) -> Result<Value> {
        let body = self.call("regenerate_section", serde_json::to_value(request)?)?;
        body.get("content")
            .cloned()
            .ok_or_else(|| anyhow!("content endpoint response is missing content"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    #[default]
    Template,
    HttpJson,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContentConfig {
    #[serde(default)]
    pub generator: GeneratorKind,
    #[serde(default)]
    pub http_json: Option<HttpJsonConfig>,
}

/// Build the configured generator.
///
/// # Errors
/// Returns an error when `http_json` is selected without its settings.
pub fn build_generator(config: &ContentConfig) -> Result<Arc<dyn ContentGenerator>> {
    match config.generator {
        GeneratorKind::Template => Ok(Arc::new(TemplateContentGenerator::new())),
        GeneratorKind::HttpJson => {
            let settings = config
                .http_json
                .clone()
                .ok_or_else(|| anyhow!("content.generator = http_json requires content.http_json"))?;
            Ok(Arc::new(HttpJsonContentGenerator::new(settings)?))
        }
    }
}
