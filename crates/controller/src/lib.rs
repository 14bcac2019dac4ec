//! Steward workload controller: one reconciliation pass for a single managed
//! Deployment, gated on management state and delegate preconditions, ending
//! in exactly one atomic status write.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use steward_core::{
    aggregate, Delegate, EventSink, ManagementIntent, NamespaceDeleter, NamespaceDeletion, PodDiagnostics,
    StateObserver, StatusMutation, StatusStore, StewardError, StewardResult, SyncContext, SyncOutcome, VersionSink,
};
use tracing::{debug, info, warn};

pub mod evaluator;

pub use evaluator::{version_gate, ConditionEvaluator, ConditionSet, ConditionTypes, Evaluation};

/// Static identity of one workload controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadControllerConfig {
    /// Suffixed with `WorkloadController` to form the controller name.
    pub name: String,
    /// Namespace of the managed Deployment; deleted when the operator is `Removed`.
    pub target_namespace: String,
    pub target_operand_version: String,
    /// Operand versions are recorded as `<operand_name_prefix>-<deployment name>`.
    pub operand_name_prefix: String,
    /// e.g. `APIServer` yields `APIServerDeploymentAvailable`.
    #[serde(default)]
    pub conditions_prefix: String,
}

impl WorkloadControllerConfig {
    pub fn controller_name(&self) -> String { format!("{}WorkloadController", self.name) }
}

/// Everything a pass talks to. All of it is owned elsewhere.
#[derive(Clone)]
pub struct Collaborators {
    pub observer: Arc<dyn StateObserver>,
    pub status: Arc<dyn StatusStore>,
    pub namespaces: Arc<dyn NamespaceDeleter>,
    pub delegate: Arc<dyn Delegate>,
    pub versions: Arc<dyn VersionSink>,
    pub pods: Arc<dyn PodDiagnostics>,
    pub events: Arc<dyn EventSink>,
}

pub struct WorkloadController {
    name: String,
    target_namespace: String,
    evaluator: ConditionEvaluator,
    c: Collaborators,
}

impl WorkloadController {
    pub fn new(cfg: WorkloadControllerConfig, c: Collaborators) -> Self {
        let evaluator = ConditionEvaluator::new(
            &cfg.conditions_prefix,
            cfg.target_namespace.clone(),
            cfg.operand_name_prefix.clone(),
            cfg.target_operand_version.clone(),
        );
        Self { name: cfg.controller_name(), target_namespace: cfg.target_namespace, evaluator, c }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Run one reconciliation pass. The returned error is what the work queue
    /// uses to decide on a rate-limited requeue.
    pub async fn sync(&self, ctx: &SyncContext) -> StewardResult<()> {
        let started = Instant::now();
        let res = self.sync_pass(ctx).await;
        histogram!("workload_sync_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(()) => {
                counter!("workload_sync_total", 1u64, "outcome" => "ok");
            }
            Err(e) => {
                counter!("workload_sync_total", 1u64, "outcome" => "error");
                debug!(controller = %self.name, key = %ctx.key(), error = %e, "sync pass failed");
            }
        }
        res
    }

    async fn sync_pass(&self, ctx: &SyncContext) -> StewardResult<()> {
        ctx.ensure_active()?;
        let intent = self.c.observer.management_intent(ctx).await.map_err(StewardError::ManagementState)?;
        if !self.should_sync(ctx, &intent).await? {
            return Ok(());
        }

        ctx.ensure_active()?;
        let precondition = self.c.delegate.precondition_fulfilled(ctx).await;
        let precondition_errors = match precondition {
            Ok(true) => None,
            Ok(false) => Some(Vec::new()),
            Err(e) => Some(vec![e]),
        };
        if let Some(errors) = precondition_errors {
            info!(controller = %self.name, errors = errors.len(), "preconditions not fulfilled");
            let evaluation = self.evaluator.precondition_failure(&errors);
            self.write_status(ctx, &evaluation.mutations()).await?;
            return aggregate(errors);
        }

        ctx.ensure_active()?;
        let outcome = self.c.delegate.sync(ctx).await;
        self.report(ctx, outcome).await
    }

    /// Decide from the management state whether this pass proceeds to sync.
    async fn should_sync(&self, ctx: &SyncContext, intent: &ManagementIntent) -> StewardResult<bool> {
        match intent {
            ManagementIntent::Managed => Ok(true),
            ManagementIntent::Unmanaged => {
                debug!(controller = %self.name, "unmanaged; skipping");
                Ok(false)
            }
            ManagementIntent::Removed => {
                let deletion = self.c.namespaces.delete_namespace(ctx, &self.target_namespace).await.map_err(|error| {
                    StewardError::NamespaceDelete { namespace: self.target_namespace.clone(), error }
                })?;
                match deletion {
                    NamespaceDeletion::Deleted => info!(namespace = %self.target_namespace, "removed; target namespace deleted"),
                    NamespaceDeletion::AlreadyAbsent => debug!(namespace = %self.target_namespace, "removed; target namespace already gone"),
                }
                Ok(false)
            }
            ManagementIntent::Unknown(raw) => {
                self.c
                    .events
                    .warn("ManagementStateUnknown", &format!("Unrecognized operator management state {:?}", raw));
                Ok(false)
            }
        }
    }

    async fn report(&self, ctx: &SyncContext, outcome: SyncOutcome) -> StewardResult<()> {
        let evaluation = self.evaluator.evaluate(ctx, &outcome, self.c.pods.as_ref()).await;
        if let Some(v) = &evaluation.version {
            self.c.versions.set_version(&v.operand_key, &v.version);
        }
        self.write_status(ctx, &evaluation.mutations()).await?;
        aggregate(outcome.errors)
    }

    async fn write_status(&self, ctx: &SyncContext, mutations: &[StatusMutation]) -> StewardResult<()> {
        let update = self.c.status.update_status(ctx, mutations).await.map_err(|e| {
            warn!(controller = %self.name, error = %e, "status update failed");
            StewardError::StatusUpdate(e)
        })?;
        if update.changed {
            counter!("workload_status_writes_total", 1u64);
            debug!(controller = %self.name, conditions = update.new.conditions.len(), "status updated");
        }
        Ok(())
    }
}
