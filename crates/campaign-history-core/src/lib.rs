#![forbid(unsafe_code)]

use anyhow::Result;
use campaign_domain::{DateTimeUtc, RuntimeStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FailureDetails {
    pub kind: String,
    pub message: String,
}

impl FailureDetails {
    #[must_use]
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// One orchestration instance as tracked by the durable-execution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub orchestration: String,
    pub input: Value,
    pub runtime_status: RuntimeStatus,
    pub custom_status: Option<Value>,
    pub output: Option<Value>,
    pub failure: Option<FailureDetails>,
    pub created_time: DateTimeUtc,
    pub last_updated_time: DateTimeUtc,
    /// Bumped on every reset. Writes made on behalf of one drive carry the
    /// generation it loaded so they cannot land on a later incarnation.
    pub generation: u64,
}

impl InstanceRecord {
    #[must_use]
    pub fn pending(
        instance_id: &str,
        orchestration: &str,
        input: Value,
        created_time: DateTimeUtc,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            orchestration: orchestration.to_string(),
            input,
            runtime_status: RuntimeStatus::Pending,
            custom_status: None,
            output: None,
            failure: None,
            created_time,
            last_updated_time: created_time,
            generation: 0,
        }
    }
}

/// Recorded outcome of one activity call. `seq` is the 0-based position of
/// the call within the orchestration body.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    ActivityCompleted {
        seq: u32,
        name: String,
        input_hash: String,
        result: Value,
    },
    ActivityFailed {
        seq: u32,
        name: String,
        input_hash: String,
        failure: FailureDetails,
    },
}

impl HistoryEvent {
    #[must_use]
    pub fn seq(&self) -> u32 {
        match self {
            Self::ActivityCompleted { seq, .. } | Self::ActivityFailed { seq, .. } => *seq,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ActivityCompleted { name, .. } | Self::ActivityFailed { name, .. } => name,
        }
    }

    #[must_use]
    pub fn input_hash(&self) -> &str {
        match self {
            Self::ActivityCompleted { input_hash, .. } | Self::ActivityFailed { input_hash, .. } => {
                input_hash
            }
        }
    }
}

/// Durable log behind the orchestration engine: instance records plus the
/// per-instance activity history replayed on every drive.
pub trait HistoryStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// Insert a fresh instance. Returns `false` when the id already exists.
    #[allow(clippy::missing_errors_doc)]
    fn try_create_instance(&self, record: &InstanceRecord) -> Result<bool>;

    /// Replace an existing instance with `record` and clear its history, but
    /// only while its current status is one of `resettable`. The stored
    /// generation is bumped; `record.generation` is ignored. Returns `false`
    /// when the status did not match.
    #[allow(clippy::missing_errors_doc)]
    fn reset_instance(&self, record: &InstanceRecord, resettable: &[RuntimeStatus])
        -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// Newest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_instances(&self, orchestration: Option<&str>, limit: usize)
        -> Result<Vec<InstanceRecord>>;

    /// Instances still `Pending` or `Running`, oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_unfinished(&self) -> Result<Vec<InstanceRecord>>;

    /// Move a non-terminal instance to `status`. With `generation`, only
    /// that incarnation moves. Returns `false` when the instance is missing,
    /// already terminal, or was reset since.
    #[allow(clippy::missing_errors_doc)]
    fn transition_instance(
        &self,
        instance_id: &str,
        generation: Option<u64>,
        status: RuntimeStatus,
        output: Option<&Value>,
        failure: Option<&FailureDetails>,
    ) -> Result<bool>;

    /// Only a pending or running instance still at `generation` is updated.
    /// Returns whether the row changed.
    #[allow(clippy::missing_errors_doc)]
    fn set_custom_status(
        &self,
        instance_id: &str,
        generation: u64,
        custom_status: &Value,
    ) -> Result<bool>;

    /// Returns `false` without writing when the instance is no longer at
    /// `generation`.
    #[allow(clippy::missing_errors_doc)]
    fn append_history(&self, instance_id: &str, generation: u64, event: &HistoryEvent)
        -> Result<bool>;

    /// Ordered by `seq`.
    #[allow(clippy::missing_errors_doc)]
    fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>>;
}
