//! Turns one pass worth of observations into the four condition families.

use smallvec::SmallVec;
use steward_core::{
    join_messages, Condition, ConditionStatus, GenerationStatus, PodDiagnostics, StatusMutation, SyncContext,
    SyncOutcome, VersionRecord, WorkloadObservation, WorkloadState,
};
use tracing::{debug, warn};

pub const REASON_AS_EXPECTED: &str = "AsExpected";
pub const REASON_PRECONDITION_NOT_FULFILLED: &str = "PreconditionNotFulfilled";
pub const REASON_SYNC_ERROR: &str = "SyncError";
pub const REASON_NO_DEPLOYMENT: &str = "NoDeployment";
pub const REASON_NO_POD: &str = "NoPod";
pub const REASON_NEW_GENERATION: &str = "NewGeneration";
pub const REASON_UNAVAILABLE_POD: &str = "UnavailablePod";

const MISSING_PRECONDITIONS_MESSAGE: &str = "the operator didn't specify what preconditions are missing";

/// Condition type names, derived from the caller-supplied prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionTypes {
    pub available: String,
    pub degraded: String,
    pub progressing: String,
    /// Sub-resource family: errors reported by the delegate while syncing.
    pub workload_degraded: String,
}

impl ConditionTypes {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            available: format!("{}DeploymentAvailable", prefix),
            degraded: format!("{}DeploymentDegraded", prefix),
            progressing: format!("{}DeploymentProgressing", prefix),
            workload_degraded: format!("{}WorkloadDegraded", prefix),
        }
    }
}

/// Exactly one condition per family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionSet {
    pub available: Condition,
    pub degraded: Condition,
    pub progressing: Condition,
    pub workload_degraded: Condition,
}

impl ConditionSet {
    fn baseline(types: &ConditionTypes) -> Self {
        Self {
            available: Condition::new(&types.available, ConditionStatus::True),
            degraded: Condition::new(&types.degraded, ConditionStatus::False),
            progressing: Condition::new(&types.progressing, ConditionStatus::False),
            workload_degraded: Condition::new(&types.workload_degraded, ConditionStatus::False),
        }
    }
}

/// Everything one pass wants written, plus the version-gate decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub conditions: ConditionSet,
    pub generation: Option<GenerationStatus>,
    pub version: Option<VersionRecord>,
}

impl Evaluation {
    /// The mutation list for the single status update of this pass.
    pub fn mutations(&self) -> SmallVec<[StatusMutation; 5]> {
        let c = &self.conditions;
        let mut out: SmallVec<[StatusMutation; 5]> = SmallVec::new();
        out.push(StatusMutation::SetCondition(c.available.clone()));
        out.push(StatusMutation::SetCondition(c.degraded.clone()));
        out.push(StatusMutation::SetCondition(c.progressing.clone()));
        out.push(StatusMutation::SetCondition(c.workload_degraded.clone()));
        if let Some(g) = &self.generation {
            out.push(StatusMutation::SetGeneration(g.clone()));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    types: ConditionTypes,
    target_namespace: String,
    operand_name_prefix: String,
    target_operand_version: String,
}

impl ConditionEvaluator {
    pub fn new(
        conditions_prefix: &str,
        target_namespace: impl Into<String>,
        operand_name_prefix: impl Into<String>,
        target_operand_version: impl Into<String>,
    ) -> Self {
        Self {
            types: ConditionTypes::with_prefix(conditions_prefix),
            target_namespace: target_namespace.into(),
            operand_name_prefix: operand_name_prefix.into(),
            target_operand_version: target_operand_version.into(),
        }
    }

    /// Preconditions are missing: degraded, not available and not progressing.
    pub fn precondition_failure(&self, errors: &[anyhow::Error]) -> Evaluation {
        let mut message = join_messages(errors);
        if message.is_empty() {
            message = MISSING_PRECONDITIONS_MESSAGE.to_string();
        }
        let mut set = ConditionSet::baseline(&self.types);
        set.degraded = Condition::new(&self.types.degraded, ConditionStatus::True)
            .reason(REASON_PRECONDITION_NOT_FULFILLED)
            .message(message);
        set.available = Condition::new(&self.types.available, ConditionStatus::False).reason(REASON_PRECONDITION_NOT_FULFILLED);
        set.progressing =
            Condition::new(&self.types.progressing, ConditionStatus::False).reason(REASON_PRECONDITION_NOT_FULFILLED);
        Evaluation { conditions: set, generation: None, version: None }
    }

    /// Derive conditions from what the delegate reported.
    pub async fn evaluate(&self, ctx: &SyncContext, outcome: &SyncOutcome, pods: &dyn PodDiagnostics) -> Evaluation {
        let mut set = ConditionSet::baseline(&self.types);
        if !outcome.errors.is_empty() {
            set.workload_degraded = Condition::new(&self.types.workload_degraded, ConditionStatus::True)
                .reason(REASON_SYNC_ERROR)
                .message(join_messages(&outcome.errors));
        }

        let workload = match &outcome.observation {
            WorkloadObservation::Present(w) => w,
            WorkloadObservation::Absent => {
                let message = format!("deployment/{}: could not be retrieved", self.target_namespace);
                set.available = Condition::new(&self.types.available, ConditionStatus::False)
                    .reason(REASON_NO_DEPLOYMENT)
                    .message(&message);
                set.progressing = Condition::new(&self.types.progressing, ConditionStatus::True)
                    .reason(REASON_NO_DEPLOYMENT)
                    .message(&message);
                set.degraded = Condition::new(&self.types.degraded, ConditionStatus::True)
                    .reason(REASON_NO_DEPLOYMENT)
                    .message(&message);
                return Evaluation { conditions: set, generation: None, version: None };
            }
        };

        let desired = workload.desired_replicas();
        let qualified = format!("{}.{}", workload.name, self.target_namespace);

        set.available = if workload.available_replicas > 0 {
            Condition::new(&self.types.available, ConditionStatus::True).reason(REASON_AS_EXPECTED)
        } else {
            Condition::new(&self.types.available, ConditionStatus::False)
                .reason(REASON_NO_POD)
                .message(format!("no {} pods available on any node.", qualified))
        };

        set.progressing = if workload.at_highest_generation() {
            Condition::new(&self.types.progressing, ConditionStatus::False).reason(REASON_AS_EXPECTED)
        } else {
            Condition::new(&self.types.progressing, ConditionStatus::True)
                .reason(REASON_NEW_GENERATION)
                .message(format!(
                    "deployment/{}: observed generation is {}, desired generation is {}.",
                    qualified, workload.observed_generation, workload.generation
                ))
        };

        // >= rather than ==: a rolling update may surge above the desired count.
        set.degraded = if workload.available_replicas >= desired {
            Condition::new(&self.types.degraded, ConditionStatus::False).reason(REASON_AS_EXPECTED)
        } else {
            let missing = desired - workload.available_replicas;
            let details = match pods.pod_containers_status(ctx, workload).await {
                Ok(states) => states,
                Err(e) => {
                    warn!(workload = %qualified, error = %e, "pod container diagnostics unavailable");
                    vec![format!("failed to get pod containers details: {:#}", e)]
                }
            };
            Condition::new(&self.types.degraded, ConditionStatus::True)
                .reason(REASON_UNAVAILABLE_POD)
                .message(format!(
                    "{} of {} requested instances are unavailable for {} ({})",
                    missing,
                    desired,
                    qualified,
                    details.join(", ")
                ))
        };

        let version = if version_gate(workload, outcome.config_at_highest_generation) {
            Some(VersionRecord {
                operand_key: format!("{}-{}", self.operand_name_prefix, workload.name),
                version: self.target_operand_version.clone(),
            })
        } else {
            None
        };
        debug!(workload = %qualified, desired, available = workload.available_replicas, gate = version.is_some(), "conditions evaluated");

        Evaluation {
            conditions: set,
            generation: Some(GenerationStatus::deployment(&workload.namespace, &workload.name, workload.generation)),
            version,
        }
    }
}

/// The operand is at the target version only once the rollout has fully
/// landed. A version bump changes the pod template, which first opens a new
/// generation and so closes this gate until that rollout completes.
pub fn version_gate(workload: &WorkloadState, config_at_highest_generation: bool) -> bool {
    let desired = workload.desired_replicas();
    workload.at_highest_generation()
        && workload.available_replicas >= desired
        && workload.updated_replicas == desired
        && config_at_highest_generation
}
