//! Markdown campaign pack rendered from a run's JSON artifacts.

use std::fmt::Write;

use anyhow::Result;
use campaign_artifacts::{fetch_artifact, ArtifactStore, RunLocation};
use campaign_domain::{ArtifactKind, CampaignArtifact, CampaignError, EvidenceItem};
use tracing::warn;

/// Render the campaign pack for the run at `location`. `Ok(None)` when the campaign
/// artifact does not exist yet. The separate evidence log is optional; the
/// campaign's own copy is used without it.
///
/// # Errors
/// Returns an error when the store fails, or a [`CampaignError::Integrity`]
/// when the campaign artifact is malformed.
pub fn export_run(store: &dyn ArtifactStore, location: RunLocation<'_>) -> Result<Option<String>> {
    let run_id = location.run_id();
    let Some(bytes) = fetch_artifact(store, location, ArtifactKind::Campaign)? else {
        return Ok(None);
    };
    let campaign: CampaignArtifact = serde_json::from_slice(&bytes).map_err(|err| {
        CampaignError::Integrity(format!("campaign.json for run {run_id} is malformed: {err}"))
    })?;

    let evidence = match fetch_artifact(store, location, ArtifactKind::Evidence)? {
        Some(bytes) => match serde_json::from_slice::<Vec<EvidenceItem>>(&bytes) {
            Ok(items) => items,
            Err(err) => {
                warn!(run_id, error = %err, "evidence_log.json is malformed; using campaign copy");
                campaign.evidence_log.clone()
            }
        },
        None => campaign.evidence_log.clone(),
    };

    Ok(Some(render_markdown(run_id, &campaign, &evidence)?))
}

fn cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

/// # Errors
/// Only fails if writing to the output string fails.
pub fn render_markdown(
    run_id: &str,
    campaign: &CampaignArtifact,
    evidence: &[EvidenceItem],
) -> Result<String, std::fmt::Error> {
    let mut out = String::new();
    writeln!(out, "# Campaign Pack")?;
    writeln!(out)?;
    writeln!(out, "Run ID: `{run_id}`")?;
    writeln!(out)?;

    writeln!(out, "## Executive Summary")?;
    writeln!(out)?;
    writeln!(out, "{}", campaign.executive_summary)?;
    writeln!(out)?;

    let landing = &campaign.landing_page;
    writeln!(out, "## Landing Page")?;
    writeln!(out)?;
    writeln!(out, "### {}", landing.headline)?;
    writeln!(out)?;
    writeln!(out, "_{}_", landing.subheadline)?;
    writeln!(out)?;
    for section in &landing.sections {
        writeln!(out, "#### {}", section.title)?;
        writeln!(out)?;
        if let Some(content) = &section.content {
            writeln!(out, "{content}")?;
            writeln!(out)?;
        }
        if let Some(bullets) = &section.bullets {
            for bullet in bullets {
                writeln!(out, "- {bullet}")?;
            }
            writeln!(out)?;
        }
    }
    writeln!(out, "**CTA:** {}", landing.cta)?;
    writeln!(out)?;

    writeln!(out, "## Emails")?;
    writeln!(out)?;
    for (index, email) in campaign.emails.iter().enumerate() {
        writeln!(out, "### Email {}: {}", index + 1, email.subject)?;
        writeln!(out)?;
        writeln!(out, "_Preview: {}_", email.preview)?;
        writeln!(out)?;
        writeln!(out, "{}", email.body)?;
        writeln!(out)?;
    }

    writeln!(out, "## Sales Enablement")?;
    writeln!(out)?;
    writeln!(out, "**Call script:** {}", campaign.sales_enablement.call_script)?;
    writeln!(out)?;
    writeln!(out, "**One-pager:** {}", campaign.sales_enablement.one_pager)?;
    writeln!(out)?;

    writeln!(out, "## Evidence")?;
    writeln!(out)?;
    writeln!(out, "| ID | Publisher | Title | Date | URL |")?;
    writeln!(out, "|---|---|---|---|---|")?;
    for item in evidence {
        writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            cell(&item.id),
            cell(&item.publisher),
            cell(&item.title),
            cell(&item.date),
            cell(&item.url)
        )?;
    }
    writeln!(out)?;

    let proof = &campaign.input_proof;
    writeln!(out, "## Input Proof")?;
    writeln!(out)?;
    writeln!(out, "- run_id: {}", proof.run_id)?;
    writeln!(out, "- csv_sha256: {}", proof.csv_sha256)?;
    writeln!(out, "- row_count: {}", proof.row_count)?;
    if let Some(hash) = &proof.filters_sha256 {
        writeln!(out, "- filters_sha256: {hash}")?;
    }
    writeln!(
        out,
        "- ignored_columns_confirmed: {}",
        proof.ignored_columns_confirmed.join(", ")
    )?;
    for warning in &proof.warnings {
        writeln!(out, "- warning: {warning}")?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_artifacts::{put_json, InMemoryArtifactStore};
    use campaign_domain::{
        CampaignMeta, EmailDraft, InputProof, LandingPage, LandingSection, SalesEnablement,
    };

    fn campaign(run_id: &str) -> CampaignArtifact {
        CampaignArtifact {
            executive_summary: "Summary text".to_string(),
            landing_page: LandingPage {
                headline: "Headline".to_string(),
                subheadline: "Sub".to_string(),
                sections: vec![LandingSection {
                    title: "Features".to_string(),
                    content: None,
                    bullets: Some(vec!["One".to_string()]),
                }],
                cta: "Book a call".to_string(),
            },
            emails: vec![EmailDraft {
                subject: "Hello".to_string(),
                preview: "Preview".to_string(),
                body: "Body".to_string(),
            }],
            sales_enablement: SalesEnablement {
                call_script: "Script".to_string(),
                one_pager: "Pager".to_string(),
            },
            evidence_log: vec![EvidenceItem {
                id: "ev-001".to_string(),
                publisher: "Ofcom".to_string(),
                title: "A | B".to_string(),
                date: "2025-03-07".to_string(),
                url: "https://example.org".to_string(),
                excerpt: "x".to_string(),
            }],
            input_proof: InputProof {
                run_id: run_id.to_string(),
                csv_sha256: "unknown".to_string(),
                row_count: 120,
                filters: None,
                filters_sha256: None,
                ignored_columns_confirmed: vec!["AdopterProfile".to_string()],
                warnings: Vec::new(),
            },
            meta: CampaignMeta {
                tone_profile: "professional".to_string(),
                persona_focus: "UK tech decision-maker".to_string(),
                evidence_window_months: 6,
                compliance_footer: true,
            },
        }
    }

    #[test]
    fn missing_campaign_exports_nothing() {
        let store = InMemoryArtifactStore::new();
        let exported = export_run(&store, RunLocation::Discover("R1"));
        assert!(exported.is_ok());
        assert_eq!(exported.unwrap_or_else(|_| unreachable!()), None);
    }

    #[test]
    fn pack_contains_every_section() {
        let store = InMemoryArtifactStore::new();
        let path = "results/campaign/connectivity/2025/03/07/R1/campaign.json";
        assert!(put_json(&store, path, &campaign("R1")).is_ok());

        let exported = export_run(&store, RunLocation::Discover("R1")).unwrap_or_else(|_| unreachable!());
        let markdown = exported.unwrap_or_else(|| unreachable!());
        assert!(markdown.contains("Run ID: `R1`"));
        assert!(markdown.contains("### Headline"));
        assert!(markdown.contains("- One"));
        assert!(markdown.contains("### Email 1: Hello"));
        assert!(markdown.contains("| ev-001 | Ofcom | A \\| B | 2025-03-07 | https://example.org |"));
        assert!(markdown.contains("- row_count: 120"));
    }

    #[test]
    fn malformed_campaign_is_an_integrity_error() {
        let store = InMemoryArtifactStore::new();
        let path = "results/campaign/connectivity/2025/03/07/R1/campaign.json";
        assert!(store.put(path, b"{\"not\": \"a campaign\"}").is_ok());

        let err = export_run(&store, RunLocation::Discover("R1")).err();
        assert!(matches!(
            err.and_then(|err| err.downcast::<CampaignError>().ok()),
            Some(CampaignError::Integrity(_))
        ));
    }
}
