use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use campaign_domain::{hash_json, now_utc, validate_path_segment, DateTimeUtc, RuntimeStatus};
use campaign_history_core::{FailureDetails, HistoryEvent, HistoryStore, InstanceRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::{
    history_error, ActivityDef, ActivityEnv, ActivityError, EngineConfig, EngineError,
    OrchestrationDef, RetryPolicy, ACTIVITIES, ORCHESTRATIONS,
};

/// What to do when `start_new` targets an instance id that already exists.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReusePolicy {
    /// Pending, running and completed instances are reused; failed and
    /// terminated ones are reset and run again.
    AttachUnlessFailed,
    /// Only pending and running instances are reused; any finished instance
    /// is reset and run again.
    AttachWhileActive,
}

impl ReusePolicy {
    fn resettable(self) -> &'static [RuntimeStatus] {
        match self {
            Self::AttachUnlessFailed => &[RuntimeStatus::Failed, RuntimeStatus::Terminated],
            Self::AttachWhileActive => &[
                RuntimeStatus::Completed,
                RuntimeStatus::Failed,
                RuntimeStatus::Terminated,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Created,
    Attached,
    Restarted,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StartOutcome {
    pub instance_id: String,
    pub disposition: Disposition,
}

/// Replay-based durable execution engine. Orchestration bodies are re-run
/// from the start on every drive; activity calls already recorded in the
/// instance history return their recorded outcome instead of executing.
pub struct Engine {
    store: Arc<dyn HistoryStore>,
    env: ActivityEnv,
    config: EngineConfig,
    orchestrations: &'static [OrchestrationDef],
    activities: &'static [ActivityDef],
    /// Instances being driven, each with a flag asking its driver to go
    /// round again because the instance was reset under it.
    active: Mutex<HashMap<String, bool>>,
}

impl Engine {
    #[must_use]
    pub fn new(store: Arc<dyn HistoryStore>, env: ActivityEnv, config: EngineConfig) -> Self {
        Self::with_registry(store, env, config, ORCHESTRATIONS, ACTIVITIES)
    }

    #[must_use]
    pub fn with_registry(
        store: Arc<dyn HistoryStore>,
        env: ActivityEnv,
        config: EngineConfig,
        orchestrations: &'static [OrchestrationDef],
        activities: &'static [ActivityDef],
    ) -> Self {
        Self {
            store,
            env,
            config,
            orchestrations,
            activities,
            active: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn env(&self) -> &ActivityEnv {
        &self.env
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn orchestration(&self, name: &str) -> Result<&'static OrchestrationDef, EngineError> {
        self.orchestrations
            .iter()
            .find(|def| def.name == name)
            .ok_or_else(|| EngineError::UnknownOrchestration(name.to_string()))
    }

    fn activity(&self, name: &str) -> Result<&'static ActivityDef, EngineError> {
        self.activities
            .iter()
            .find(|def| def.name == name)
            .ok_or_else(|| EngineError::UnknownActivity(name.to_string()))
    }

    /// Create an instance, or reuse/reset an existing one with the same id
    /// according to `policy`. Does not drive it; call [`Engine::run_instance`].
    ///
    /// # Errors
    /// Returns an error for unknown orchestrations, invalid or foreign
    /// instance ids, and history store failures.
    pub fn start_new(
        &self,
        orchestration: &str,
        instance_id: Option<&str>,
        input: Value,
        policy: ReusePolicy,
    ) -> Result<StartOutcome, EngineError> {
        self.orchestration(orchestration)?;
        let instance_id = match instance_id {
            Some(id) => {
                validate_path_segment("instance_id", id)
                    .map_err(|err| EngineError::InvalidInstanceId(err.to_string()))?;
                id.to_string()
            }
            None => Ulid::new().to_string(),
        };

        let record = InstanceRecord::pending(&instance_id, orchestration, input, now_utc());
        if self
            .store
            .try_create_instance(&record)
            .map_err(history_error)?
        {
            info!(%instance_id, orchestration, "instance created");
            return Ok(StartOutcome {
                instance_id,
                disposition: Disposition::Created,
            });
        }

        let existing = self
            .store
            .get_instance(&instance_id)
            .map_err(history_error)?
            .ok_or_else(|| {
                EngineError::History(format!("instance {instance_id} vanished during start"))
            })?;
        if existing.orchestration != orchestration {
            return Err(EngineError::InvalidInstanceId(format!(
                "{instance_id} already belongs to {}",
                existing.orchestration
            )));
        }

        let resettable = policy.resettable();
        if resettable.contains(&existing.runtime_status)
            && self
                .store
                .reset_instance(&record, resettable)
                .map_err(history_error)?
        {
            info!(
                %instance_id,
                orchestration,
                previous = existing.runtime_status.as_str(),
                "instance restarted"
            );
            self.request_rerun(&instance_id)?;
            return Ok(StartOutcome {
                instance_id,
                disposition: Disposition::Restarted,
            });
        }

        debug!(
            %instance_id,
            status = existing.runtime_status.as_str(),
            "attached to existing instance"
        );
        Ok(StartOutcome {
            instance_id,
            disposition: Disposition::Attached,
        })
    }

    /// Drive an instance until it finishes. Returns the instance as it stands
    /// afterwards. A second concurrent caller for the same id returns at once
    /// without driving; if the instance was restarted meanwhile, the driver
    /// already holding it picks up the new generation before letting go.
    ///
    /// # Errors
    /// Returns an error when the history store fails; the instance is then
    /// left unfinished for recovery.
    pub fn run_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, EngineError> {
        let Some(mut guard) = DriveGuard::acquire(&self.active, instance_id)? else {
            debug!(instance_id, "instance already driven by another worker");
            return self.get_instance(instance_id);
        };

        loop {
            self.drive(instance_id)?;
            if !guard.release_unless_rerun()? {
                break;
            }
            info!(instance_id, "instance restarted during drive; driving new generation");
        }

        self.get_instance(instance_id)
    }

    fn drive(&self, instance_id: &str) -> Result<(), EngineError> {
        let Some(instance) = self.get_instance(instance_id)? else {
            return Ok(());
        };
        if instance.runtime_status.is_terminal() {
            return Ok(());
        }
        let def = self.orchestration(&instance.orchestration)?;
        let generation = Some(instance.generation);

        if instance.runtime_status == RuntimeStatus::Pending
            && !self
                .store
                .transition_instance(instance_id, generation, RuntimeStatus::Running, None, None)
                .map_err(history_error)?
        {
            debug!(instance_id, "instance changed before its drive began");
            return Ok(());
        }

        let history = self.store.load_history(instance_id).map_err(history_error)?;
        if !history.is_empty() {
            info!(instance_id, recorded = history.len(), "replaying instance history");
        }

        let mut ctx = OrchestrationContext::new(self, &instance, history);
        match (def.run)(&mut ctx, instance.input.clone()) {
            Ok(output) => {
                let applied = self
                    .store
                    .transition_instance(
                        instance_id,
                        generation,
                        RuntimeStatus::Completed,
                        Some(&output),
                        None,
                    )
                    .map_err(history_error)?;
                if applied {
                    info!(instance_id, orchestration = def.name, "instance completed");
                } else if self.is_superseded(&instance)? {
                    info!(instance_id, "finished drive belongs to a replaced generation");
                } else {
                    warn!(instance_id, "instance finished after it was terminated");
                    self.rerun_failure_hook(def, instance_id)?;
                }
            }
            Err(EngineError::Superseded(_)) => {
                info!(instance_id, "drive abandoned; instance was restarted");
            }
            Err(EngineError::Terminated(_)) => {
                info!(instance_id, "instance observed termination");
                if !self.is_superseded(&instance)? {
                    self.rerun_failure_hook(def, instance_id)?;
                }
            }
            Err(err @ EngineError::History(_)) => return Err(err),
            Err(err) => {
                let failure = err.failure();
                error!(
                    instance_id,
                    orchestration = def.name,
                    kind = %failure.kind,
                    error = %err,
                    "instance failed"
                );
                let applied = self
                    .store
                    .transition_instance(
                        instance_id,
                        generation,
                        RuntimeStatus::Failed,
                        None,
                        Some(&failure),
                    )
                    .map_err(history_error)?;
                if applied {
                    self.rerun_failure_hook(def, instance_id)?;
                }
            }
        }
        Ok(())
    }

    /// Mark a pending or running instance terminated. The orchestration body
    /// stops at its next activity call.
    ///
    /// # Errors
    /// Returns an error when the history store fails.
    pub fn terminate(&self, instance_id: &str, reason: &str) -> Result<bool, EngineError> {
        let failure = FailureDetails::new("terminated", reason);
        let applied = self
            .store
            .transition_instance(instance_id, None, RuntimeStatus::Terminated, None, Some(&failure))
            .map_err(history_error)?;
        if !applied {
            return Ok(false);
        }
        warn!(instance_id, reason, "instance terminated");
        if let Some(instance) = self.get_instance(instance_id)? {
            if let Ok(def) = self.orchestration(&instance.orchestration) {
                self.run_failure_hook(def, &instance, &failure);
            }
        }
        Ok(true)
    }

    /// # Errors
    /// Returns an error when the history store fails.
    pub fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, EngineError> {
        self.store.get_instance(instance_id).map_err(history_error)
    }

    /// # Errors
    /// Returns an error when the history store fails.
    pub fn list_instances(
        &self,
        orchestration: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InstanceRecord>, EngineError> {
        self.store
            .list_instances(orchestration, limit)
            .map_err(history_error)
    }

    /// Ids of instances left pending or running, e.g. by a process restart.
    ///
    /// # Errors
    /// Returns an error when the history store fails.
    pub fn recover_unfinished(&self) -> Result<Vec<String>, EngineError> {
        let unfinished = self.store.list_unfinished().map_err(history_error)?;
        if !unfinished.is_empty() {
            info!(count = unfinished.len(), "recovering unfinished instances");
        }
        Ok(unfinished
            .into_iter()
            .map(|record| record.instance_id)
            .collect())
    }

    fn rerun_failure_hook(
        &self,
        def: &OrchestrationDef,
        instance_id: &str,
    ) -> Result<(), EngineError> {
        let Some(instance) = self.get_instance(instance_id)? else {
            return Ok(());
        };
        let failure = instance
            .failure
            .clone()
            .unwrap_or_else(|| FailureDetails::new("failed", "instance ended without success"));
        self.run_failure_hook(def, &instance, &failure);
        Ok(())
    }

    fn run_failure_hook(
        &self,
        def: &OrchestrationDef,
        instance: &InstanceRecord,
        failure: &FailureDetails,
    ) {
        let Some(hook) = def.on_failure else {
            return;
        };
        if let Err(err) = hook(&self.env, instance, failure) {
            warn!(
                instance_id = %instance.instance_id,
                error = %err,
                "failure hook did not complete"
            );
        }
    }

    fn request_rerun(&self, instance_id: &str) -> Result<(), EngineError> {
        let mut active = lock_active(&self.active)?;
        if let Some(rerun) = active.get_mut(instance_id) {
            debug!(instance_id, "restarted while driven; current driver will rerun");
            *rerun = true;
        }
        Ok(())
    }

    fn is_superseded(&self, instance: &InstanceRecord) -> Result<bool, EngineError> {
        Ok(self
            .get_instance(&instance.instance_id)?
            .is_some_and(|current| current.generation != instance.generation))
    }

    /// Checked before every live activity call: the instance must still be
    /// the generation this drive loaded, and not terminated.
    fn ensure_current(&self, instance: &InstanceRecord) -> Result<(), EngineError> {
        let instance_id = &instance.instance_id;
        match self.get_instance(instance_id)? {
            Some(record) if record.generation != instance.generation => {
                Err(EngineError::Superseded(instance_id.clone()))
            }
            Some(record) if record.runtime_status == RuntimeStatus::Terminated => {
                Err(EngineError::Terminated(instance_id.clone()))
            }
            Some(_) => Ok(()),
            None => Err(EngineError::Superseded(instance_id.clone())),
        }
    }

    fn execute_activity(
        &self,
        instance_id: &str,
        seq: u32,
        def: &ActivityDef,
        input: &Value,
        policy: &RetryPolicy,
    ) -> Result<Value, ActivityError> {
        let mut attempt: u32 = 1;
        loop {
            match (def.run)(&self.env, input) {
                Ok(result) => {
                    debug!(instance_id, activity = def.name, seq, attempt, "activity completed");
                    return Ok(result);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        instance_id,
                        activity = def.name,
                        seq,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "activity failed; retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        instance_id,
                        activity = def.name,
                        seq,
                        attempt,
                        kind = err.kind(),
                        error = %err,
                        "activity failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}

struct DriveGuard<'a> {
    active: &'a Mutex<HashMap<String, bool>>,
    instance_id: String,
    released: bool,
}

impl<'a> DriveGuard<'a> {
    fn acquire(
        active: &'a Mutex<HashMap<String, bool>>,
        instance_id: &str,
    ) -> Result<Option<Self>, EngineError> {
        let mut map = lock_active(active)?;
        if map.contains_key(instance_id) {
            return Ok(None);
        }
        map.insert(instance_id.to_string(), false);
        Ok(Some(Self {
            active,
            instance_id: instance_id.to_string(),
            released: false,
        }))
    }

    /// Give up the instance unless a rerun was requested while it was held.
    /// Returns `true`, still holding it, when the caller must drive again.
    fn release_unless_rerun(&mut self) -> Result<bool, EngineError> {
        let mut map = lock_active(self.active)?;
        if let Some(rerun) = map.get_mut(&self.instance_id) {
            if *rerun {
                *rerun = false;
                return Ok(true);
            }
        }
        map.remove(&self.instance_id);
        self.released = true;
        Ok(false)
    }
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(mut map) = self.active.lock() {
            map.remove(&self.instance_id);
        }
    }
}

fn lock_active(
    active: &Mutex<HashMap<String, bool>>,
) -> Result<MutexGuard<'_, HashMap<String, bool>>, EngineError> {
    active
        .lock()
        .map_err(|_| EngineError::History("instance drive guard poisoned".to_string()))
}

/// Handle an orchestration body uses to reach the outside world. Everything
/// non-deterministic (time, identity, activity results) comes through here.
pub struct OrchestrationContext<'a> {
    engine: &'a Engine,
    instance: &'a InstanceRecord,
    history: Vec<HistoryEvent>,
    next_seq: u32,
}

impl<'a> OrchestrationContext<'a> {
    fn new(engine: &'a Engine, instance: &'a InstanceRecord, history: Vec<HistoryEvent>) -> Self {
        Self {
            engine,
            instance,
            history,
            next_seq: 0,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    /// Logical time of the instance: its creation time, identical on every
    /// replay.
    #[must_use]
    pub fn current_utc_datetime(&self) -> DateTimeUtc {
        self.instance.created_time
    }

    /// True while the body is re-executing calls already present in history.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        usize::try_from(self.next_seq).is_ok_and(|seq| seq < self.history.len())
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.engine.config.retry
    }

    /// Publish progress for pollers. Skipped while replaying, so a recovered
    /// instance never reports an earlier stage than the one it reached.
    ///
    /// # Errors
    /// Returns an error when the history store fails.
    pub fn set_custom_status(&mut self, custom_status: &Value) -> Result<(), EngineError> {
        if self.is_replaying() {
            return Ok(());
        }
        let written = self
            .engine
            .store
            .set_custom_status(
                &self.instance.instance_id,
                self.instance.generation,
                custom_status,
            )
            .map_err(history_error)?;
        if !written {
            debug!(
                instance_id = %self.instance.instance_id,
                "custom status not written; instance finished or was restarted"
            );
        }
        Ok(())
    }

    /// Call an activity once, without retries.
    ///
    /// # Errors
    /// See [`OrchestrationContext::call_activity_with_retry`].
    pub fn call_activity(&mut self, name: &str, input: Value) -> Result<Value, EngineError> {
        self.call_activity_with_retry(name, input, &RetryPolicy::no_retry())
    }

    /// Call an activity, or return its recorded outcome when replaying.
    ///
    /// # Errors
    /// Returns `NonDeterminism` when the call does not match the recorded
    /// history at this position, `Terminated` when the instance was
    /// terminated, and `Activity` when the activity (or its recorded
    /// outcome) failed.
    pub fn call_activity_with_retry(
        &mut self,
        name: &str,
        input: Value,
        policy: &RetryPolicy,
    ) -> Result<Value, EngineError> {
        let seq = self.next_seq;
        let input_hash = hash_json(&input)
            .map_err(|err| EngineError::InvalidInput(format!("activity input: {err}")))?;
        let index = usize::try_from(seq)
            .map_err(|_| EngineError::History(format!("activity seq {seq} out of range")))?;

        if let Some(recorded) = self.history.get(index) {
            if recorded.name() != name || recorded.input_hash() != input_hash {
                return Err(EngineError::NonDeterminism {
                    seq,
                    expected: recorded.name().to_string(),
                    actual: name.to_string(),
                });
            }
            self.next_seq += 1;
            return match recorded {
                HistoryEvent::ActivityCompleted { result, .. } => Ok(result.clone()),
                HistoryEvent::ActivityFailed { failure, .. } => Err(EngineError::Activity {
                    name: name.to_string(),
                    source: ActivityError::from_failure(failure),
                }),
            };
        }

        let engine = self.engine;
        let instance_id = self.instance.instance_id.as_str();
        engine.ensure_current(self.instance)?;
        let def = engine.activity(name)?;
        let outcome = engine.execute_activity(instance_id, seq, def, &input, policy);

        let event = match &outcome {
            Ok(result) => HistoryEvent::ActivityCompleted {
                seq,
                name: name.to_string(),
                input_hash,
                result: result.clone(),
            },
            Err(err) => HistoryEvent::ActivityFailed {
                seq,
                name: name.to_string(),
                input_hash,
                failure: FailureDetails::new(err.kind(), err.message()),
            },
        };
        let appended = engine
            .store
            .append_history(instance_id, self.instance.generation, &event)
            .map_err(history_error)?;
        if !appended {
            warn!(instance_id, activity = name, seq, "activity outcome dropped; instance was restarted");
            return Err(EngineError::Superseded(instance_id.to_string()));
        }
        self.history.push(event);
        self.next_seq += 1;

        outcome.map_err(|source| EngineError::Activity {
            name: name.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_content::{StaticEvidenceSource, TemplateContentGenerator};
    use campaign_history_sqlite::SqliteHistoryStore;
    use serde_json::json;

    use crate::{campaign, regenerate};

    fn engine(label: &str) -> Engine {
        let path = std::env::temp_dir()
            .join(format!("campaign-engine-{label}-{}.sqlite3", Ulid::new()));
        let store = SqliteHistoryStore::open(&path).unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        let env = ActivityEnv {
            artifacts: None,
            content: Arc::new(TemplateContentGenerator::new()),
            evidence: Arc::new(StaticEvidenceSource),
        };
        Engine::new(Arc::new(store), env, EngineConfig::default())
    }

    #[test]
    fn drive_guard_admits_one_driver_per_instance() {
        let active = Mutex::new(HashMap::new());
        let first = DriveGuard::acquire(&active, "R1").unwrap_or_else(|_| unreachable!());
        assert!(first.is_some());
        let second = DriveGuard::acquire(&active, "R1").unwrap_or_else(|_| unreachable!());
        assert!(second.is_none());
        let other = DriveGuard::acquire(&active, "R2").unwrap_or_else(|_| unreachable!());
        assert!(other.is_some());

        drop(first);
        let again = DriveGuard::acquire(&active, "R1").unwrap_or_else(|_| unreachable!());
        assert!(again.is_some());
    }

    #[test]
    fn drive_guard_holds_on_while_a_rerun_is_pending() {
        let active = Mutex::new(HashMap::new());
        let mut first = DriveGuard::acquire(&active, "R1")
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        if let Some(rerun) = lock_active(&active)
            .unwrap_or_else(|_| unreachable!())
            .get_mut("R1")
        {
            *rerun = true;
        }
        assert!(matches!(first.release_unless_rerun(), Ok(true)));
        assert!(matches!(DriveGuard::acquire(&active, "R1"), Ok(None)));
        assert!(matches!(first.release_unless_rerun(), Ok(false)));

        let second = DriveGuard::acquire(&active, "R1").unwrap_or_else(|_| unreachable!());
        assert!(second.is_some());
        drop(first);
        assert!(matches!(DriveGuard::acquire(&active, "R1"), Ok(None)));
    }

    #[test]
    fn reuse_policies_differ_only_on_completed() {
        let campaign = ReusePolicy::AttachUnlessFailed.resettable();
        let regen = ReusePolicy::AttachWhileActive.resettable();
        assert!(!campaign.contains(&RuntimeStatus::Completed));
        assert!(regen.contains(&RuntimeStatus::Completed));
        for status in [RuntimeStatus::Failed, RuntimeStatus::Terminated] {
            assert!(campaign.contains(&status));
            assert!(regen.contains(&status));
        }
        for status in [RuntimeStatus::Pending, RuntimeStatus::Running] {
            assert!(!campaign.contains(&status));
            assert!(!regen.contains(&status));
        }
    }

    #[test]
    fn start_rejects_bad_ids_and_unknown_orchestrations() {
        let engine = engine("ids");
        let policy = ReusePolicy::AttachUnlessFailed;
        assert!(matches!(
            engine.start_new(campaign::ORCHESTRATION_NAME, Some("a/b"), json!({}), policy),
            Err(EngineError::InvalidInstanceId(_))
        ));
        assert!(matches!(
            engine.start_new(campaign::ORCHESTRATION_NAME, Some(".."), json!({}), policy),
            Err(EngineError::InvalidInstanceId(_))
        ));
        assert!(matches!(
            engine.start_new("NoSuchOrchestration", None, json!({}), policy),
            Err(EngineError::UnknownOrchestration(_))
        ));
    }

    #[test]
    fn instance_ids_do_not_cross_orchestrations() {
        let engine = engine("cross");
        let created = engine.start_new(
            campaign::ORCHESTRATION_NAME,
            Some("R1"),
            json!({}),
            ReusePolicy::AttachUnlessFailed,
        );
        assert_eq!(
            created.map(|outcome| outcome.disposition),
            Ok(Disposition::Created)
        );
        assert!(matches!(
            engine.start_new(
                regenerate::ORCHESTRATION_NAME,
                Some("R1"),
                json!({}),
                ReusePolicy::AttachWhileActive,
            ),
            Err(EngineError::InvalidInstanceId(_))
        ));
    }

    #[test]
    fn generated_ids_are_fresh_per_start() {
        let engine = engine("fresh");
        let policy = ReusePolicy::AttachUnlessFailed;
        let first = engine
            .start_new(campaign::ORCHESTRATION_NAME, None, json!({}), policy)
            .unwrap_or_else(|_| unreachable!());
        let second = engine
            .start_new(campaign::ORCHESTRATION_NAME, None, json!({}), policy)
            .unwrap_or_else(|_| unreachable!());
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(second.disposition, Disposition::Created);
        let listed = engine
            .list_instances(Some(campaign::ORCHESTRATION_NAME), 10)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(listed.len(), 2);
    }
}
