#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use campaign_artifacts::{discover_prefix, ArtifactStore, InMemoryArtifactStore};
use campaign_content::{
    CampaignDraft, ContentGenerator, DraftRequest, EvidenceRequest, EvidenceSource,
    SectionRequest, StaticEvidenceSource, TemplateContentGenerator,
};
use campaign_domain::{ArtifactKind, EvidenceItem, RunPrefix, RuntimeStatus};
use campaign_history_core::{FailureDetails, HistoryEvent, HistoryStore, InstanceRecord};
use campaign_history_sqlite::SqliteHistoryStore;
use campaign_orchestrator::{ActivityEnv, CampaignApi, Engine, EngineConfig, RetryPolicy};
use serde_json::Value;
use ulid::Ulid;

pub fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("campaign-orchestrator-{label}-{}.sqlite3", Ulid::new()))
}

pub fn open_history(label: &str) -> Arc<SqliteHistoryStore> {
    let store = SqliteHistoryStore::open(&temp_db_path(label));
    assert!(store.is_ok());
    let store = store.unwrap_or_else(|_| unreachable!());
    assert!(store.migrate().is_ok());
    Arc::new(store)
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            first_interval: Duration::from_millis(1),
            backoff_coefficient: 1.0,
            max_interval: Duration::from_millis(2),
        },
        runs_list_limit: 50,
    }
}

/// Parks one evidence collection until the test lets it finish.
struct EvidenceGate {
    entered: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
pub struct CountingEvidence {
    pub calls: AtomicUsize,
    gate: Mutex<Option<EvidenceGate>>,
}

impl CountingEvidence {
    /// Park the next collection. The first handle fires once it has
    /// started; sending on the second lets it complete.
    pub fn hold_next(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut gate = self
            .gate
            .lock()
            .unwrap_or_else(|_| panic!("evidence gate poisoned"));
        *gate = Some(EvidenceGate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

impl EvidenceSource for CountingEvidence {
    fn collect(&self, request: &EvidenceRequest<'_>) -> Result<Vec<EvidenceItem>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .gate
            .lock()
            .map_err(|_| anyhow!("evidence gate poisoned"))?
            .take();
        if let Some(gate) = gate {
            gate.entered
                .send(())
                .map_err(|_| anyhow!("nobody waits for the parked collection"))?;
            gate.release
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| anyhow!("parked collection was never released"))?;
        }
        StaticEvidenceSource.collect(request)
    }
}

/// Template generator that counts drafts and can be told to fail them.
#[derive(Default)]
pub struct CountingContent {
    pub drafts: AtomicUsize,
    pub fail_drafts: AtomicBool,
    inner: TemplateContentGenerator,
}

impl ContentGenerator for CountingContent {
    fn generator_name(&self) -> &'static str {
        "counting"
    }

    fn draft_campaign(&self, request: &DraftRequest<'_>) -> Result<CampaignDraft> {
        self.drafts.fetch_add(1, Ordering::SeqCst);
        if self.fail_drafts.load(Ordering::SeqCst) {
            return Err(anyhow!("content backend unavailable"));
        }
        self.inner.draft_campaign(request)
    }

    fn regenerate_section(&self, request: &SectionRequest<'_>) -> Result<Value> {
        self.inner.regenerate_section(request)
    }
}

/// History store that loses the next history append at a chosen seq, the way
/// a crash between an activity's side effects and its recording would.
pub struct CrashingHistory {
    pub inner: Arc<SqliteHistoryStore>,
    pub crash_at_seq: AtomicUsize,
    pub armed: AtomicBool,
    published: Mutex<Vec<String>>,
}

impl CrashingHistory {
    pub fn new(inner: Arc<SqliteHistoryStore>, crash_at_seq: usize) -> Self {
        Self {
            inner,
            crash_at_seq: AtomicUsize::new(crash_at_seq),
            armed: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Every `state` written as custom status, in order.
    pub fn published_states(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(|_| panic!("published states poisoned"))
            .clone()
    }
}

impl HistoryStore for CrashingHistory {
    fn migrate(&self) -> Result<()> {
        self.inner.migrate()
    }

    fn try_create_instance(&self, record: &InstanceRecord) -> Result<bool> {
        self.inner.try_create_instance(record)
    }

    fn reset_instance(&self, record: &InstanceRecord, resettable: &[RuntimeStatus]) -> Result<bool> {
        self.inner.reset_instance(record, resettable)
    }

    fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        self.inner.get_instance(instance_id)
    }

    fn list_instances(&self, orchestration: Option<&str>, limit: usize) -> Result<Vec<InstanceRecord>> {
        self.inner.list_instances(orchestration, limit)
    }

    fn list_unfinished(&self) -> Result<Vec<InstanceRecord>> {
        self.inner.list_unfinished()
    }

    fn transition_instance(
        &self,
        instance_id: &str,
        generation: Option<u64>,
        status: RuntimeStatus,
        output: Option<&Value>,
        failure: Option<&FailureDetails>,
    ) -> Result<bool> {
        self.inner
            .transition_instance(instance_id, generation, status, output, failure)
    }

    fn set_custom_status(
        &self,
        instance_id: &str,
        generation: u64,
        custom_status: &Value,
    ) -> Result<bool> {
        if let Some(state) = custom_status.get("state").and_then(Value::as_str) {
            self.published
                .lock()
                .map_err(|_| anyhow!("published states poisoned"))?
                .push(state.to_string());
        }
        self.inner.set_custom_status(instance_id, generation, custom_status)
    }

    fn append_history(
        &self,
        instance_id: &str,
        generation: u64,
        event: &HistoryEvent,
    ) -> Result<bool> {
        let crash_at = self.crash_at_seq.load(Ordering::SeqCst);
        if usize::try_from(event.seq()).is_ok_and(|seq| seq == crash_at)
            && self.armed.swap(false, Ordering::SeqCst)
        {
            return Err(anyhow!("simulated crash before recording seq {crash_at}"));
        }
        self.inner.append_history(instance_id, generation, event)
    }

    fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>> {
        self.inner.load_history(instance_id)
    }
}

pub struct Harness {
    pub api: CampaignApi,
    pub history: Arc<dyn HistoryStore>,
    pub artifacts: Arc<InMemoryArtifactStore>,
    pub evidence: Arc<CountingEvidence>,
    pub content: Arc<CountingContent>,
}

impl Harness {
    pub fn new(label: &str) -> Self {
        let history: Arc<dyn HistoryStore> = open_history(label);
        Self::with_history(history)
    }

    pub fn with_history(history: Arc<dyn HistoryStore>) -> Self {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let evidence = Arc::new(CountingEvidence::default());
        let content = Arc::new(CountingContent::default());
        let artifact_store: Arc<dyn ArtifactStore> = artifacts.clone();
        let env = ActivityEnv {
            artifacts: Some(artifact_store),
            content: content.clone(),
            evidence: evidence.clone(),
        };
        let engine = Arc::new(Engine::new(history.clone(), env, fast_config()));
        Self {
            api: CampaignApi::new(engine),
            history,
            artifacts,
            evidence,
            content,
        }
    }

    pub fn engine(&self) -> &Engine {
        self.api.engine()
    }

    pub fn drive(&self, instance_id: &str) -> InstanceRecord {
        let record = self.engine().run_instance(instance_id);
        assert!(record.is_ok(), "run_instance failed: {record:?}");
        record
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| panic!("instance {instance_id} vanished"))
    }

    pub fn prefix(&self, run_id: &str) -> RunPrefix {
        let prefix = discover_prefix(self.artifacts.as_ref(), run_id);
        assert!(prefix.is_ok());
        prefix
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| panic!("no campaign artifact for {run_id}"))
    }

    pub fn artifact_bytes(&self, prefix: &RunPrefix, kind: ArtifactKind) -> Option<Vec<u8>> {
        self.artifacts
            .get(&prefix.artifact_path(kind))
            .unwrap_or_else(|err| panic!("artifact read failed: {err}"))
    }

    pub fn artifact_json(&self, prefix: &RunPrefix, kind: ArtifactKind) -> Value {
        let bytes = self
            .artifact_bytes(prefix, kind)
            .unwrap_or_else(|| panic!("missing {}", prefix.artifact_path(kind)));
        serde_json::from_slice(&bytes).unwrap_or_else(|err| panic!("artifact is not JSON: {err}"))
    }
}
