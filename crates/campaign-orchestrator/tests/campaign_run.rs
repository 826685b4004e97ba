mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use campaign_artifacts::{
    put_json, read_stage, write_stage, ArtifactStore, InMemoryArtifactStore, RunLocation,
};
use campaign_content::{StaticEvidenceSource, TemplateContentGenerator};
use campaign_domain::{
    hash_json, ArtifactKind, CampaignError, InputSummary, RunPrefix, RuntimeStatus, Stage,
};
use campaign_history_core::{HistoryEvent, HistoryStore};
use campaign_orchestrator::campaign::{
    self, campaign_draft, evidence_builder, validate_input, validator, StartRequest,
};
use campaign_orchestrator::{
    ActivityEnv, ApiError, CampaignApi, Disposition, Engine, EngineConfig,
};
use serde_json::{json, Value};

use common::{open_history, CrashingHistory, Harness};

fn connectivity_request() -> StartRequest {
    StartRequest {
        page: Some("connectivity".to_string()),
        row_count: Some(120),
        ..StartRequest::default()
    }
}

fn start(harness: &Harness, request: &StartRequest) -> String {
    let outcome = harness.api.start_run(request);
    assert!(outcome.is_ok(), "start failed: {outcome:?}");
    outcome.unwrap_or_else(|_| unreachable!()).instance_id
}

#[test]
fn start_then_status_reports_completed_with_result() {
    let harness = Harness::new("completed");
    let run_id = start(&harness, &connectivity_request());

    let pending = harness.api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(pending.state, Stage::ValidatingInput);
    assert_eq!(pending.result, None);
    assert!(matches!(
        harness.api.fetch(&run_id, Some("campaign")),
        Err(ApiError::Rejected(CampaignError::NotFound(_)))
    ));

    let record = harness.drive(&run_id);
    assert_eq!(record.runtime_status, RuntimeStatus::Completed);

    let status = harness.api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(status.run_id, run_id);
    assert_eq!(status.state, Stage::Completed);
    assert_eq!(
        status.input,
        Some(InputSummary {
            row_count: 120,
            page: "connectivity".to_string(),
        })
    );
    let result = status.result.unwrap_or_else(|| panic!("completed run must carry a result"));
    assert_eq!(result["runId"], json!(run_id));
    assert_eq!(result["result"]["ok"], json!(true));

    let bytes = harness
        .api
        .fetch(&run_id, Some("json"))
        .unwrap_or_else(|err| panic!("fetch failed: {err}"));
    let campaign: Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| unreachable!());
    assert_eq!(campaign["input_proof"]["run_id"], json!(run_id));
    assert_eq!(campaign["input_proof"]["row_count"], json!(120));
    assert_eq!(campaign["input_proof"]["csv_sha256"], json!("unknown"));

    let prefix = harness.prefix(&run_id);
    let expected = RunPrefix::new("connectivity", &run_id, record.created_time);
    assert_eq!(prefix, expected);
    let ledger = harness.artifact_json(&prefix, ArtifactKind::Status);
    assert_eq!(ledger["state"], json!("Completed"));
    assert_eq!(ledger["runId"], json!(run_id));

    let evidence = harness.artifact_json(&prefix, ArtifactKind::Evidence);
    assert_eq!(evidence[0]["date"], json!(prefix.date_string()));
}

#[test]
fn start_defaults_page_and_rejects_nested_pages() {
    let harness = Harness::new("defaults");
    let run_id = start(&harness, &StartRequest::default());
    harness.drive(&run_id);
    assert_eq!(harness.prefix(&run_id).page, "default");

    let rejected = harness.api.start_run(&StartRequest {
        page: Some("a/b".to_string()),
        ..StartRequest::default()
    });
    assert!(matches!(
        rejected,
        Err(ApiError::Rejected(CampaignError::Validation(_)))
    ));
    let runs = harness.api.list_runs(None).unwrap_or_else(|_| unreachable!());
    assert_eq!(runs.len(), 1);
}

#[test]
fn activities_rerun_with_identical_input_write_identical_bytes() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let env = ActivityEnv {
        artifacts: Some(store.clone()),
        content: Arc::new(TemplateContentGenerator::new()),
        evidence: Arc::new(StaticEvidenceSource),
    };
    let prefix = RunPrefix::parse("results/campaign/connectivity/2025/03/07/R1/")
        .unwrap_or_else(|_| unreachable!());
    let base = json!({
        "prefix": prefix.to_string(),
        "run_id": "R1",
        "page": "connectivity",
        "row_count": 120,
        "filters": {"region": "UK"},
        "csv_sha256": null,
        "company": null,
    });

    let snapshot = |kind: ArtifactKind| {
        store
            .get(&prefix.artifact_path(kind))
            .unwrap_or_else(|_| unreachable!())
    };

    let first_proof = validate_input(&env, &base).unwrap_or_else(|_| unreachable!());
    let status_after_validate = snapshot(ArtifactKind::Status);
    let second_proof = validate_input(&env, &base).unwrap_or_else(|_| unreachable!());
    assert_eq!(first_proof, second_proof);
    assert_eq!(status_after_validate, snapshot(ArtifactKind::Status));

    let first_evidence = evidence_builder(&env, &base).unwrap_or_else(|_| unreachable!());
    let evidence_bytes = snapshot(ArtifactKind::Evidence);
    let second_evidence = evidence_builder(&env, &base).unwrap_or_else(|_| unreachable!());
    assert_eq!(first_evidence, second_evidence);
    assert_eq!(evidence_bytes, snapshot(ArtifactKind::Evidence));

    let mut draft_input = base.clone();
    draft_input["evidence_log"] = first_evidence["evidence_log"].clone();
    draft_input["input_proof"] = first_proof["input_proof"].clone();
    assert!(campaign_draft(&env, &draft_input).is_ok());
    let campaign_bytes = snapshot(ArtifactKind::Campaign);
    assert!(campaign_draft(&env, &draft_input).is_ok());
    assert_eq!(campaign_bytes, snapshot(ArtifactKind::Campaign));

    let first_gate = validator(&env, &base).unwrap_or_else(|_| unreachable!());
    let gate_status = snapshot(ArtifactKind::Status);
    let second_gate = validator(&env, &base).unwrap_or_else(|_| unreachable!());
    assert_eq!(first_gate, second_gate);
    assert_eq!(gate_status, snapshot(ArtifactKind::Status));
    assert!(campaign_bytes.is_some());
}

#[test]
fn activity_missing_required_fields_is_invalid_input() {
    let harness = Harness::new("invalid-input");
    let env = harness.engine().env();
    let result = validate_input(env, &json!({"run_id": "R1", "page": "p"}));
    assert_eq!(result.map_err(|err| err.kind()), Err("invalid_input"));
}

#[test]
fn crash_before_recording_replays_finished_steps_and_reruns_the_lost_one() {
    let inner = open_history("crash");
    let crashing = Arc::new(CrashingHistory::new(inner, 2));
    let history: Arc<dyn HistoryStore> = crashing.clone();
    let harness = Harness::with_history(history);
    let run_id = start(&harness, &connectivity_request());

    let first = harness.engine().run_instance(&run_id);
    assert!(first.is_err(), "lost history write must surface");
    let unfinished = harness.engine().recover_unfinished().unwrap_or_else(|_| unreachable!());
    assert_eq!(unfinished, vec![run_id.clone()]);
    assert_eq!(harness.evidence.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.content.drafts.load(Ordering::SeqCst), 1);

    let record = harness.drive(&run_id);
    assert_eq!(record.runtime_status, RuntimeStatus::Completed);
    assert_eq!(harness.evidence.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.content.drafts.load(Ordering::SeqCst), 2);

    let history = harness.history.load_history(&run_id).unwrap_or_else(|_| unreachable!());
    let names: Vec<&str> = history.iter().map(HistoryEvent::name).collect();
    assert_eq!(
        names,
        vec![
            campaign::VALIDATE_INPUT,
            campaign::EVIDENCE_BUILDER,
            campaign::CAMPAIGN_DRAFT,
            campaign::VALIDATOR
        ]
    );

    // The recovery drive replays the first two steps without republishing
    // their stages.
    assert_eq!(
        crashing.published_states(),
        vec![
            "ValidatingInput",
            "EvidenceBuilder",
            "DraftCampaign",
            "DraftCampaign",
            "QualityGate",
            "Completed"
        ]
    );
}

#[test]
fn diverging_history_fails_the_run_as_non_deterministic() {
    let harness = Harness::new("nondeterminism");
    let run_id = start(&harness, &connectivity_request());
    let bogus = HistoryEvent::ActivityCompleted {
        seq: 0,
        name: campaign::EVIDENCE_BUILDER.to_string(),
        input_hash: hash_json(&json!({})).unwrap_or_else(|_| unreachable!()),
        result: json!({}),
    };
    assert!(matches!(harness.history.append_history(&run_id, 0, &bogus), Ok(true)));

    let record = harness.drive(&run_id);
    assert_eq!(record.runtime_status, RuntimeStatus::Failed);
    assert_eq!(
        record.failure.map(|failure| failure.kind),
        Some("non_determinism".to_string())
    );
    assert_eq!(harness.evidence.calls.load(Ordering::SeqCst), 0);

    let status = harness.api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(status.state, Stage::Failed);
}

#[test]
fn failing_activity_is_retried_then_fails_run_and_ledger() {
    let harness = Harness::new("failing");
    harness.content.fail_drafts.store(true, Ordering::SeqCst);
    let run_id = start(&harness, &connectivity_request());

    let record = harness.drive(&run_id);
    assert_eq!(record.runtime_status, RuntimeStatus::Failed);
    assert_eq!(harness.content.drafts.load(Ordering::SeqCst), 2);

    let ledger = read_stage(harness.artifacts.as_ref(), RunLocation::Discover(&run_id))
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| panic!("failed run must have a ledger record"));
    assert_eq!(ledger.stage, Stage::Failed);
    assert_eq!(
        harness.api.status(&run_id).map(|view| view.state),
        Ok(Stage::Failed)
    );

    harness.content.fail_drafts.store(false, Ordering::SeqCst);
    let restarted = harness.api.start_run(&StartRequest {
        run_id: Some(run_id.clone()),
        ..connectivity_request()
    });
    assert_eq!(
        restarted.map(|outcome| outcome.disposition),
        Ok(Disposition::Restarted)
    );
    let record = harness.drive(&run_id);
    assert_eq!(record.runtime_status, RuntimeStatus::Completed);
    assert_eq!(
        harness.api.status(&run_id).map(|view| view.state),
        Ok(Stage::Completed)
    );
}

fn fixed_run(run_id: &str, page: &str) -> StartRequest {
    StartRequest {
        run_id: Some(run_id.to_string()),
        page: Some(page.to_string()),
        row_count: Some(120),
        ..StartRequest::default()
    }
}

#[test]
fn restart_on_another_page_reads_only_the_new_prefix() {
    let harness = Harness::new("restart-page");
    harness.content.fail_drafts.store(true, Ordering::SeqCst);
    let first = harness
        .api
        .start_run(&fixed_run("R-move", "zeta"))
        .unwrap_or_else(|err| panic!("start failed: {err}"));
    assert_eq!(first.disposition, Disposition::Created);
    let failed = harness.drive("R-move");
    assert_eq!(failed.runtime_status, RuntimeStatus::Failed);

    // The same date and a greater page make the old prefix win any suffix scan.
    let stale = RunPrefix::new("zeta", "R-move", failed.created_time);
    let planted = put_json(
        harness.artifacts.as_ref(),
        &stale.artifact_path(ArtifactKind::Campaign),
        &json!({"stale": true}),
    );
    assert!(planted.is_ok());

    harness.content.fail_drafts.store(false, Ordering::SeqCst);
    let restarted = harness.api.start_run(&fixed_run("R-move", "alpha"));
    assert_eq!(
        restarted.map(|outcome| outcome.disposition),
        Ok(Disposition::Restarted)
    );
    let record = harness.drive("R-move");
    assert_eq!(record.runtime_status, RuntimeStatus::Completed);
    assert_eq!(record.generation, 1);
    let current = RunPrefix::new("alpha", "R-move", record.created_time);

    let status = harness.api.status("R-move").unwrap_or_else(|err| panic!("status failed: {err}"));
    assert_eq!(status.state, Stage::Completed);
    assert_eq!(status.input.map(|input| input.page), Some("alpha".to_string()));

    let bytes = harness
        .api
        .fetch("R-move", None)
        .unwrap_or_else(|err| panic!("fetch failed: {err}"));
    let campaign: Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| unreachable!());
    assert_eq!(campaign.get("stale"), None);
    assert_eq!(campaign["input_proof"]["run_id"], json!("R-move"));
    let markdown = harness
        .api
        .export("R-move")
        .unwrap_or_else(|err| panic!("export failed: {err}"));
    assert!(markdown.starts_with("# Campaign Pack"));

    let regen = harness
        .api
        .regenerate(Some("R-move"), Some("landing"), None)
        .unwrap_or_else(|err| panic!("regenerate failed: {err}"));
    let regen_record = harness.drive(&regen.instance_id);
    assert_eq!(regen_record.runtime_status, RuntimeStatus::Completed);
    let refreshed = harness.artifact_json(&current, ArtifactKind::Campaign);
    assert!(refreshed["meta"]["regenerations"]["landing"].is_object());
    assert_eq!(
        harness.artifact_json(&stale, ArtifactKind::Campaign),
        json!({"stale": true})
    );
    assert_eq!(
        harness.artifact_json(&stale, ArtifactKind::Status)["state"],
        json!("Failed")
    );
}

#[test]
fn termination_during_an_activity_freezes_published_progress() {
    let harness = Arc::new(Harness::new("terminate-live"));
    let run_id = start(&harness, &connectivity_request());
    let (entered, release) = harness.evidence.hold_next();
    let driver = {
        let harness = Arc::clone(&harness);
        let run_id = run_id.clone();
        thread::spawn(move || harness.drive(&run_id))
    };
    entered
        .recv_timeout(Duration::from_secs(10))
        .unwrap_or_else(|_| panic!("evidence collection never started"));

    assert_eq!(harness.api.terminate(&run_id, Some("operator stop")), Ok(true));
    release
        .send(())
        .unwrap_or_else(|_| panic!("parked collection is gone"));
    let record = driver
        .join()
        .unwrap_or_else(|_| panic!("driver thread panicked"));

    assert_eq!(record.runtime_status, RuntimeStatus::Terminated);
    assert_eq!(
        record.custom_status.as_ref().and_then(|status| status.get("state")),
        Some(&json!("EvidenceBuilder"))
    );
    assert_eq!(harness.content.drafts.load(Ordering::SeqCst), 0);
    let status = harness.api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(status.state, Stage::Failed);
}

#[test]
fn restart_while_a_drive_is_parked_runs_the_new_input() {
    let harness = Arc::new(Harness::new("restart-live"));
    let first = harness
        .api
        .start_run(&fixed_run("RR", "old"))
        .unwrap_or_else(|err| panic!("start failed: {err}"));
    assert_eq!(first.disposition, Disposition::Created);

    let (entered, release) = harness.evidence.hold_next();
    let driver = {
        let harness = Arc::clone(&harness);
        thread::spawn(move || harness.drive("RR"))
    };
    entered
        .recv_timeout(Duration::from_secs(10))
        .unwrap_or_else(|_| panic!("evidence collection never started"));

    assert_eq!(harness.api.terminate("RR", Some("operator stop")), Ok(true));
    let restarted = harness.api.start_run(&fixed_run("RR", "new"));
    assert_eq!(
        restarted.map(|outcome| outcome.disposition),
        Ok(Disposition::Restarted)
    );
    let attached = harness.drive("RR");
    assert_eq!(attached.runtime_status, RuntimeStatus::Pending);
    assert_eq!(attached.generation, 1);

    release
        .send(())
        .unwrap_or_else(|_| panic!("parked collection is gone"));
    let record = driver
        .join()
        .unwrap_or_else(|_| panic!("driver thread panicked"));

    assert_eq!(record.runtime_status, RuntimeStatus::Completed);
    assert_eq!(record.generation, 1);
    assert_eq!(record.input["page"], json!("new"));
    let current = RunPrefix::new("new", "RR", record.created_time);
    assert_eq!(
        record.output.as_ref().and_then(|output| output.get("prefix")),
        Some(&json!(current.to_string()))
    );

    let history = harness.history.load_history("RR").unwrap_or_else(|_| unreachable!());
    assert_eq!(history.len(), 4);
    assert_eq!(harness.evidence.calls.load(Ordering::SeqCst), 2);

    let status = harness.api.status("RR").unwrap_or_else(|_| unreachable!());
    assert_eq!(status.state, Stage::Completed);
    assert_eq!(status.input.map(|input| input.page), Some("new".to_string()));
    assert_eq!(
        harness.artifact_json(&current, ArtifactKind::Campaign)["input_proof"]["run_id"],
        json!("RR")
    );
}

#[test]
fn restarting_a_completed_run_attaches_without_running_again() {
    let harness = Harness::new("attach");
    let request = StartRequest {
        run_id: Some("R-fixed".to_string()),
        ..connectivity_request()
    };
    let first = harness.api.start_run(&request).unwrap_or_else(|_| unreachable!());
    assert_eq!(first.instance_id, "R-fixed");
    assert_eq!(first.disposition, Disposition::Created);
    harness.drive("R-fixed");

    let second = harness.api.start_run(&request).unwrap_or_else(|_| unreachable!());
    assert_eq!(second.disposition, Disposition::Attached);
    harness.drive("R-fixed");
    assert_eq!(harness.evidence.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn terminated_run_never_reports_progress() {
    let harness = Harness::new("terminate");
    let run_id = start(&harness, &connectivity_request());

    assert_eq!(harness.api.terminate(&run_id, Some("operator stop")), Ok(true));
    assert_eq!(harness.api.terminate(&run_id, None), Ok(false));

    let ledger = read_stage(harness.artifacts.as_ref(), RunLocation::Discover(&run_id))
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| panic!("terminated run must have a ledger record"));
    assert_eq!(ledger.stage, Stage::Failed);

    let record = harness.drive(&run_id);
    assert_eq!(record.runtime_status, RuntimeStatus::Terminated);
    assert_eq!(harness.evidence.calls.load(Ordering::SeqCst), 0);

    let status = harness.api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(status.state, Stage::Failed);
    assert_eq!(status.runtime.runtime_status, Some(RuntimeStatus::Terminated));

    assert!(matches!(
        harness.api.terminate("missing", None),
        Err(ApiError::Rejected(CampaignError::NotFound(_)))
    ));
}

#[test]
fn unknown_run_status_is_not_found() {
    let harness = Harness::new("unknown");
    assert!(matches!(
        harness.api.status("never-started"),
        Err(ApiError::Rejected(CampaignError::NotFound(_)))
    ));
    assert!(matches!(
        harness.api.status(""),
        Err(ApiError::Rejected(CampaignError::Validation(_)))
    ));
}

#[test]
fn ledger_record_overrides_engine_guess() {
    let harness = Harness::new("override");
    let run_id = start(&harness, &connectivity_request());
    let record = harness
        .engine()
        .get_instance(&run_id)
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    let prefix = RunPrefix::new("connectivity", &run_id, record.created_time);
    let written = write_stage(
        harness.artifacts.as_ref(),
        &prefix,
        Stage::QualityGate,
        InputSummary {
            row_count: 120,
            page: "connectivity".to_string(),
        },
    );
    assert!(written.is_ok());

    let status = harness.api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(status.state, Stage::QualityGate);
    assert_eq!(status.runtime.runtime_status, Some(RuntimeStatus::Pending));
}

#[test]
fn ledger_only_run_is_still_reported() {
    let harness = Harness::new("ledger-only");
    let prefix = RunPrefix::parse("results/campaign/legacy/2024/11/02/OLD1/")
        .unwrap_or_else(|_| unreachable!());
    let written = write_stage(
        harness.artifacts.as_ref(),
        &prefix,
        Stage::DraftCampaign,
        InputSummary {
            row_count: 7,
            page: "legacy".to_string(),
        },
    );
    assert!(written.is_ok());

    let status = harness.api.status("OLD1").unwrap_or_else(|_| unreachable!());
    assert_eq!(status.run_id, "OLD1");
    assert_eq!(status.state, Stage::DraftCampaign);
    assert_eq!(status.runtime.runtime_status, None);
}

#[test]
fn missing_artifact_store_is_a_configuration_failure() {
    let history = open_history("unconfigured");
    let env = ActivityEnv {
        artifacts: None,
        content: Arc::new(TemplateContentGenerator::new()),
        evidence: Arc::new(StaticEvidenceSource),
    };
    let api = CampaignApi::new(Arc::new(Engine::new(history, env, EngineConfig::default())));
    let run_id = api
        .start_run(&connectivity_request())
        .unwrap_or_else(|_| unreachable!())
        .instance_id;

    let record = api
        .engine()
        .run_instance(&run_id)
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(record.runtime_status, RuntimeStatus::Failed);
    assert_eq!(
        record.failure.map(|failure| failure.kind),
        Some("configuration".to_string())
    );

    let status = api.status(&run_id).unwrap_or_else(|_| unreachable!());
    assert_eq!(status.state, Stage::Failed);
    assert!(matches!(
        api.fetch(&run_id, None),
        Err(ApiError::Rejected(CampaignError::Configuration(_)))
    ));
    assert!(matches!(
        api.export(&run_id),
        Err(ApiError::Rejected(CampaignError::Configuration(_)))
    ));
}

#[test]
fn fetch_and_export_follow_discovery() {
    let harness = Harness::new("fetch");
    let run_id = start(&harness, &connectivity_request());
    harness.drive(&run_id);

    for kind in ["campaign", "evidence", "status"] {
        let fetched = harness.api.fetch(&run_id, Some(kind));
        assert!(fetched.is_ok(), "fetch {kind} failed: {fetched:?}");
    }
    assert!(matches!(
        harness.api.fetch(&run_id, Some("docx")),
        Err(ApiError::Rejected(CampaignError::Validation(_)))
    ));

    let markdown = harness.api.export(&run_id).unwrap_or_else(|_| unreachable!());
    assert!(markdown.starts_with("# Campaign Pack"));
    assert!(markdown.contains(&format!("Run ID: `{run_id}`")));
    assert!(matches!(
        harness.api.export("missing"),
        Err(ApiError::Rejected(CampaignError::NotFound(_)))
    ));
}

#[test]
fn runs_are_listed_newest_first() {
    let harness = Harness::new("listing");
    let older = start(&harness, &connectivity_request());
    std::thread::sleep(Duration::from_millis(5));
    let newer = start(
        &harness,
        &StartRequest {
            page: Some("mobile".to_string()),
            row_count: Some(3),
            ..StartRequest::default()
        },
    );

    let runs = harness.api.list_runs(None).unwrap_or_else(|_| unreachable!());
    let ids: Vec<&str> = runs.iter().map(|run| run.run_id.as_str()).collect();
    assert_eq!(ids, vec![newer.as_str(), older.as_str()]);
    assert_eq!(runs[0].page.as_deref(), Some("mobile"));
    assert_eq!(runs[0].row_count, Some(3));

    let limited = harness.api.list_runs(Some(1)).unwrap_or_else(|_| unreachable!());
    assert_eq!(limited.len(), 1);
}
