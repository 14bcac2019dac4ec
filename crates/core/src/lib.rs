//! Steward core: workload observations, management intent, the published
//! status document and the collaborator traits a reconciliation pass talks to.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod error;
mod status;

pub use error::{aggregate, join_messages, AggregateError, StewardError, StewardResult};
pub use status::{
    apply_mutations, Condition, ConditionStatus, GenerationStatus, OperatorCondition, OperatorStatus,
    StatusMutation, StatusUpdate,
};

/// Operator management state as set by a cluster administrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ManagementIntent {
    Managed,
    Unmanaged,
    Removed,
    /// Anything else, kept verbatim for diagnostics.
    Unknown(String),
}

impl ManagementIntent {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Managed" => ManagementIntent::Managed,
            "Unmanaged" => ManagementIntent::Unmanaged,
            "Removed" => ManagementIntent::Removed,
            other => ManagementIntent::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ManagementIntent::Managed => "Managed",
            ManagementIntent::Unmanaged => "Unmanaged",
            ManagementIntent::Removed => "Removed",
            ManagementIntent::Unknown(raw) => raw,
        }
    }
}

impl FromStr for ManagementIntent {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Ok(Self::parse(s)) }
}

impl From<String> for ManagementIntent {
    fn from(v: String) -> Self { Self::parse(&v) }
}

impl From<ManagementIntent> for String {
    fn from(v: ManagementIntent) -> Self { v.as_str().to_string() }
}

impl fmt::Display for ManagementIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Observed state of the managed workload for one pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadState {
    pub name: String,
    pub namespace: String,
    pub generation: i64,
    pub observed_generation: i64,
    /// `None` when the source object left the field unset.
    pub desired_replicas: Option<i32>,
    pub available_replicas: i32,
    pub updated_replicas: i32,
    /// Pod template labels; used to find the workload's pods.
    #[serde(default)]
    pub template_labels: BTreeMap<String, String>,
}

impl WorkloadState {
    pub fn desired_replicas(&self) -> i32 { self.desired_replicas.unwrap_or(1) }
    pub fn at_highest_generation(&self) -> bool { self.generation == self.observed_generation }
    pub fn qualified_name(&self) -> String { format!("{}.{}", self.name, self.namespace) }
}

/// The workload either could be fetched or it could not; both are meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadObservation {
    Present(WorkloadState),
    Absent,
}

impl From<Option<WorkloadState>> for WorkloadObservation {
    fn from(v: Option<WorkloadState>) -> Self {
        v.map_or(WorkloadObservation::Absent, WorkloadObservation::Present)
    }
}

/// What a delegate reports back after trying to bring the workload into operation.
#[derive(Debug)]
pub struct SyncOutcome {
    pub observation: WorkloadObservation,
    /// Whether the delegate's own configuration is at its highest-seen generation.
    pub config_at_highest_generation: bool,
    pub errors: Vec<anyhow::Error>,
}

impl SyncOutcome {
    pub fn new(observation: WorkloadObservation, config_at_highest_generation: bool, errors: Vec<anyhow::Error>) -> Self {
        Self { observation, config_at_highest_generation, errors }
    }
}

/// `Ok(false)` is an unfulfilled precondition without an explicit cause.
pub type PreconditionResult = anyhow::Result<bool>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub operand_key: String,
    pub version: String,
}

/// Per-pass context: the queue key being processed and a cooperative cancellation token.
#[derive(Debug, Clone)]
pub struct SyncContext {
    key: String,
    cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(key: impl Into<String>) -> Self { Self::with_token(key, CancellationToken::new()) }

    pub fn with_token(key: impl Into<String>, cancel: CancellationToken) -> Self {
        Self { key: key.into(), cancel }
    }

    pub fn key(&self) -> &str { &self.key }
    pub fn token(&self) -> &CancellationToken { &self.cancel }
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Resolves once the pass has been cancelled.
    pub async fn cancelled(&self) { self.cancel.cancelled().await }

    pub fn ensure_active(&self) -> StewardResult<()> {
        if self.is_cancelled() { Err(StewardError::Cancelled) } else { Ok(()) }
    }
}

// ---- collaborator traits ----

/// Read access to management intent and the currently published status.
#[async_trait::async_trait]
pub trait StateObserver: Send + Sync {
    async fn management_intent(&self, ctx: &SyncContext) -> anyhow::Result<ManagementIntent>;
    fn current_status(&self) -> Arc<OperatorStatus>;
}

/// Write-through for the status document. Implementations must apply all
/// mutations of one call atomically.
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    async fn update_status(&self, ctx: &SyncContext, mutations: &[StatusMutation]) -> anyhow::Result<StatusUpdate>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceDeletion {
    Deleted,
    AlreadyAbsent,
}

#[async_trait::async_trait]
pub trait NamespaceDeleter: Send + Sync {
    async fn delete_namespace(&self, ctx: &SyncContext, namespace: &str) -> anyhow::Result<NamespaceDeletion>;
}

pub trait VersionSink: Send + Sync {
    fn set_version(&self, operand_key: &str, version: &str);
}

/// Best-effort per-pod container details for a workload that is short on replicas.
#[async_trait::async_trait]
pub trait PodDiagnostics: Send + Sync {
    async fn pod_containers_status(&self, ctx: &SyncContext, workload: &WorkloadState) -> anyhow::Result<Vec<String>>;
}

/// Fire-and-forget diagnostic events.
pub trait EventSink: Send + Sync {
    fn warn(&self, reason: &str, message: &str);
}

/// Event sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

impl EventSink for LogEvents {
    fn warn(&self, reason: &str, message: &str) {
        warn!(reason = %reason, "{}", message);
    }
}

/// Workload-kind specific logic plugged into the generic controller.
#[async_trait::async_trait]
pub trait Delegate: Send + Sync {
    /// Missing preconditions are reported in status: degraded, not available, not progressing.
    async fn precondition_fulfilled(&self, ctx: &SyncContext) -> PreconditionResult;

    /// Bring the desired workload into operation and report what was observed.
    async fn sync(&self, ctx: &SyncContext) -> SyncOutcome;
}
