//! Steward placement: sizing a workload to the number of eligible nodes and
//! constraining it to at most one pod per node.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{Node, PodAffinityTerm, PodAntiAffinity};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use steward_core::{StewardError, StewardResult, SyncContext};
use tracing::debug;

pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const ANTI_AFFINITY_VALUE: &str = "true";

pub fn anti_affinity_label_key(component: &str) -> String {
    format!("{}-anti-affinity", component)
}

/// Label the pod template and add a required pod anti-affinity term on that
/// label plus the deployment's own selector labels, so no two pods of the
/// same replica set land on one node.
///
/// `spec` is validated before it is touched; on error it is left unchanged.
pub fn ensure_at_most_one_pod_per_node(spec: &mut DeploymentSpec, component: &str) -> StewardResult<()> {
    if component.is_empty() {
        return Err(StewardError::InvalidArgument("please specify the component name".into()));
    }
    let selector = &spec.selector;
    if selector.match_labels.is_none() && selector.match_expressions.is_none() {
        return Err(StewardError::InvalidArgument("deployment is missing spec.selector".into()));
    }
    let selector_labels = match selector.match_labels.as_ref() {
        Some(labels) if !labels.is_empty() => labels.clone(),
        _ => return Err(StewardError::InvalidArgument("deployment is missing spec.selector.matchLabels".into())),
    };

    let key = anti_affinity_label_key(component);
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.clone(), ANTI_AFFINITY_VALUE.to_string());

    let mut match_labels = BTreeMap::from([(key, ANTI_AFFINITY_VALUE.to_string())]);
    match_labels.extend(selector_labels);

    let term = PodAffinityTerm {
        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
        label_selector: Some(LabelSelector { match_labels: Some(match_labels), ..Default::default() }),
        ..Default::default()
    };
    let affinity = spec.template.spec.get_or_insert_with(Default::default).affinity.get_or_insert_with(Default::default);
    affinity.pod_anti_affinity = Some(PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![term]),
        ..Default::default()
    });
    debug!(component = %component, "anti-affinity applied");
    Ok(())
}

/// Set `replicas` to `count` and pin the pod template onto nodes matching `node_selector`.
pub fn size_to_nodes(spec: &mut DeploymentSpec, node_selector: &BTreeMap<String, String>, count: i32) {
    spec.replicas = Some(count);
    if node_selector.is_empty() {
        return;
    }
    spec.template
        .spec
        .get_or_insert_with(Default::default)
        .node_selector
        .get_or_insert_with(Default::default)
        .extend(node_selector.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Render an equality selector as `k=v,k2=v2` (keys sorted).
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Equality-selector match against an object's labels. An empty selector matches everything.
pub fn labels_match(selector: &BTreeMap<String, String>, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

#[async_trait::async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_nodes(&self, ctx: &SyncContext, selector: &BTreeMap<String, String>) -> Result<Vec<Node>>;
}

#[async_trait::async_trait]
impl<T: NodeLister + ?Sized> NodeLister for Arc<T> {
    async fn list_nodes(&self, ctx: &SyncContext, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        (**self).list_nodes(ctx, selector).await
    }
}

/// Node lister over a fixed set of nodes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNodes {
    pub nodes: Vec<Node>,
}

#[async_trait::async_trait]
impl NodeLister for InMemoryNodes {
    async fn list_nodes(&self, _ctx: &SyncContext, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        Ok(self.nodes.iter().filter(|n| labels_match(selector, n.metadata.labels.as_ref())).cloned().collect())
    }
}

/// Counts nodes matching a selector, e.g. to run one replica per control-plane node.
pub struct NodeCounter<L> {
    lister: L,
}

impl<L: NodeLister> NodeCounter<L> {
    pub fn new(lister: L) -> Self { Self { lister } }

    /// Fails with [`StewardError::Cancelled`] once the pass is cancelled,
    /// even if the lister itself never returns.
    pub async fn count(&self, ctx: &SyncContext, selector: &BTreeMap<String, String>) -> Result<i32> {
        let nodes = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(StewardError::Cancelled.into()),
            r = self.lister.list_nodes(ctx, selector) => r?,
        };
        let count = i32::try_from(nodes.len()).unwrap_or(i32::MAX);
        debug!(selector = %selector_string(selector), count, "counted nodes");
        Ok(count)
    }
}
