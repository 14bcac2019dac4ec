//! Deployment delegate driven by a manifest: place it, server-side apply it
//! into the target namespace, read back what the cluster holds.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use steward_core::{Delegate, PreconditionResult, StewardResult, SyncContext, SyncOutcome, WorkloadObservation};
use steward_placement::{ensure_at_most_one_pod_per_node, size_to_nodes, NodeCounter, NodeLister};
use tracing::{debug, info, warn};

use crate::{cancellable, observe_deployment};

/// Placement policies applied to the manifest before every apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// When set, at most one pod of this component per node.
    #[serde(default)]
    pub anti_affinity_component: Option<String>,
    /// Run one replica per node matching `node_selector`.
    #[serde(default)]
    pub size_to_nodes: bool,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

pub fn parse_manifest(yaml: &str) -> Result<Deployment> {
    let d: Deployment = serde_yaml::from_str(yaml).context("parsing deployment manifest")?;
    if d.metadata.name.as_deref().map_or(true, str::is_empty) {
        return Err(anyhow!("deployment manifest is missing metadata.name"));
    }
    if d.spec.is_none() {
        return Err(anyhow!("deployment manifest is missing spec"));
    }
    Ok(d)
}

/// The manifest as it will be applied: moved into `namespace`, sized to
/// `node_count` when given, then constrained by anti-affinity.
pub fn render_manifest(
    manifest: &Deployment,
    namespace: &str,
    placement: &Placement,
    node_count: Option<i32>,
) -> StewardResult<Deployment> {
    let mut d = manifest.clone();
    d.metadata.namespace = Some(namespace.to_string());
    d.metadata.resource_version = None;
    d.metadata.managed_fields = None;
    d.status = None;
    let spec = d.spec.get_or_insert_with(Default::default);
    if let Some(count) = node_count {
        size_to_nodes(spec, &placement.node_selector, count);
    }
    if let Some(component) = placement.anti_affinity_component.as_deref() {
        ensure_at_most_one_pod_per_node(spec, component)?;
    }
    Ok(d)
}

pub struct DeploymentDelegate<L> {
    client: Client,
    namespace: String,
    manifest: Deployment,
    placement: Placement,
    nodes: NodeCounter<L>,
    field_manager: String,
}

impl<L: NodeLister> DeploymentDelegate<L> {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        manifest: Deployment,
        placement: Placement,
        nodes: L,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            manifest,
            placement,
            nodes: NodeCounter::new(nodes),
            field_manager: field_manager.into(),
        }
    }

    fn name(&self) -> &str { self.manifest.metadata.name.as_deref().unwrap_or_default() }

    fn api(&self) -> Api<Deployment> { Api::namespaced(self.client.clone(), &self.namespace) }

    /// Render with the live node count, as `sync` would.
    pub async fn render(&self, ctx: &SyncContext) -> Result<Deployment> {
        let node_count = if self.placement.size_to_nodes {
            Some(self.nodes.count(ctx, &self.placement.node_selector).await.context("counting nodes")?)
        } else {
            None
        };
        Ok(render_manifest(&self.manifest, &self.namespace, &self.placement, node_count)?)
    }

    async fn apply(&self, ctx: &SyncContext) -> Result<Deployment> {
        let started = Instant::now();
        let desired = cancellable(ctx, "render deployment", self.render(ctx)).await?;
        let pp = PatchParams::apply(&self.field_manager).force();
        let api = self.api();
        let res = cancellable(ctx, "apply deployment", async {
            api.patch(self.name(), &pp, &Patch::Apply(&desired)).await.map_err(anyhow::Error::from)
        })
        .await;
        histogram!("delegate_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(d) => {
                counter!("delegate_apply_total", 1u64, "outcome" => "ok");
                debug!(deployment = %self.name(), namespace = %self.namespace, generation = ?d.metadata.generation, "deployment applied");
                Ok(d)
            }
            Err(e) => {
                counter!("delegate_apply_total", 1u64, "outcome" => "error");
                Err(e.context(format!("applying deployment/{}", self.name())))
            }
        }
    }

    async fn read_back(&self, ctx: &SyncContext) -> Result<Option<Deployment>> {
        let api = self.api();
        cancellable(ctx, "get deployment", async { api.get_opt(self.name()).await.map_err(anyhow::Error::from) })
            .await
            .with_context(|| format!("getting deployment/{}", self.name()))
    }
}

#[async_trait::async_trait]
impl<L: NodeLister> Delegate for DeploymentDelegate<L> {
    async fn precondition_fulfilled(&self, ctx: &SyncContext) -> PreconditionResult {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = cancellable(ctx, "get namespace", async {
            api.get_opt(&self.namespace).await.map_err(anyhow::Error::from)
        })
        .await?;
        match ns {
            None => Err(anyhow!("namespace {} does not exist", self.namespace)),
            Some(ns) if ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating") => {
                Err(anyhow!("namespace {} is terminating", self.namespace))
            }
            Some(_) => Ok(true),
        }
    }

    async fn sync(&self, ctx: &SyncContext) -> SyncOutcome {
        let mut errors = Vec::new();
        let (observed, config_at_highest_generation) = match self.apply(ctx).await {
            Ok(d) => (Some(d), true),
            Err(e) => {
                warn!(deployment = %self.name(), error = %format!("{:#}", e), "apply failed; reading back live state");
                errors.push(e);
                match self.read_back(ctx).await {
                    Ok(d) => (d, false),
                    Err(e) => {
                        errors.push(e);
                        (None, false)
                    }
                }
            }
        };
        if observed.is_none() {
            info!(deployment = %self.name(), namespace = %self.namespace, "deployment not present");
        }
        SyncOutcome::new(
            WorkloadObservation::from(observed.as_ref().map(observe_deployment)),
            config_at_highest_generation,
            errors,
        )
    }
}
