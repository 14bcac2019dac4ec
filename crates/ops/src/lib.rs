//! Steward ops: the collaborators a reconcile pass needs, backed by kube-rs.
//! Namespace deletion, node listing, pod container diagnostics, and the
//! manifest-driven [`DeploymentDelegate`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams},
    Client,
};
use steward_core::{NamespaceDeleter, NamespaceDeletion, PodDiagnostics, SyncContext, WorkloadState};
use steward_placement::{selector_string, NodeLister};
use tracing::{debug, info};

pub mod delegate;

pub use delegate::{parse_manifest, render_manifest, DeploymentDelegate, Placement};

/// Race `fut` against cancellation of the pass.
pub(crate) async fn cancellable<T, F>(ctx: &SyncContext, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(anyhow!("{}: cancelled", what)),
        r = fut => r,
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// A namespace that is already gone counts as deleted.
fn deletion_outcome<T>(res: Result<T>) -> Result<NamespaceDeletion> {
    match res {
        Ok(_) => Ok(NamespaceDeletion::Deleted),
        Err(e) if e.downcast_ref::<kube::Error>().is_some_and(is_not_found) => Ok(NamespaceDeletion::AlreadyAbsent),
        Err(e) => Err(e),
    }
}

/// List params for an equality selector; empty selects everything.
pub fn list_params(selector: &BTreeMap<String, String>) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector_string(selector))
    }
}

pub struct KubeNamespaces {
    client: Client,
}

impl KubeNamespaces {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl NamespaceDeleter for KubeNamespaces {
    async fn delete_namespace(&self, ctx: &SyncContext, namespace: &str) -> Result<NamespaceDeletion> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let res = cancellable(ctx, "delete namespace", async {
            api.delete(namespace, &DeleteParams::default()).await.map_err(anyhow::Error::from)
        })
        .await;
        let outcome = deletion_outcome(res)?;
        if outcome == NamespaceDeletion::Deleted {
            info!(namespace = %namespace, "namespace deletion requested");
        }
        Ok(outcome)
    }
}

pub struct KubeNodes {
    client: Client,
}

impl KubeNodes {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl NodeLister for KubeNodes {
    async fn list_nodes(&self, ctx: &SyncContext, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let lp = list_params(selector);
        let list = cancellable(ctx, "list nodes", async { api.list(&lp).await.context("listing nodes") }).await?;
        Ok(list.items)
    }
}

pub struct KubePods {
    client: Client,
}

impl KubePods {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl PodDiagnostics for KubePods {
    async fn pod_containers_status(&self, ctx: &SyncContext, workload: &WorkloadState) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
        let lp = list_params(&workload.template_labels);
        let pods = cancellable(ctx, "list pods", async { api.list(&lp).await.context("listing pods") }).await?;
        debug!(workload = %workload.qualified_name(), pods = pods.items.len(), "pod diagnostics");
        Ok(container_diagnostics(&pods.items))
    }
}

/// One line per container that is waiting, terminated, or not ready.
pub fn container_diagnostics(pods: &[Pod]) -> Vec<String> {
    let mut out = Vec::new();
    for pod in pods {
        let pod_name = pod.metadata.name.as_deref().unwrap_or("<unnamed>");
        let statuses = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref());
        for cs in statuses.into_iter().flatten() {
            let state = cs.state.as_ref();
            if let Some(w) = state.and_then(|s| s.waiting.as_ref()) {
                let mut line = format!(
                    "pod/{} container \"{}\" is waiting: {}",
                    pod_name,
                    cs.name,
                    w.reason.as_deref().unwrap_or("Unknown")
                );
                if let Some(msg) = w.message.as_deref().filter(|m| !m.is_empty()) {
                    line.push_str(" - ");
                    line.push_str(msg);
                }
                out.push(line);
            } else if let Some(t) = state.and_then(|s| s.terminated.as_ref()) {
                out.push(format!(
                    "pod/{} container \"{}\" is terminated: {} (exit code {})",
                    pod_name,
                    cs.name,
                    t.reason.as_deref().unwrap_or("Unknown"),
                    t.exit_code
                ));
            } else if !cs.ready {
                out.push(format!("pod/{} container \"{}\" is not ready", pod_name, cs.name));
            }
        }
    }
    out
}

/// Project a live Deployment onto the fields the evaluator reads.
pub fn observe_deployment(d: &Deployment) -> WorkloadState {
    let spec = d.spec.as_ref();
    let status = d.status.as_ref();
    WorkloadState {
        name: d.metadata.name.clone().unwrap_or_default(),
        namespace: d.metadata.namespace.clone().unwrap_or_default(),
        generation: d.metadata.generation.unwrap_or(0),
        observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
        desired_replicas: spec.and_then(|s| s.replicas),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
        template_labels: spec
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodStatus, PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> anyhow::Error {
        let e = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("namespaces \"openshift-apiserver\" {}", reason),
            reason: reason.into(),
            code,
        });
        anyhow::Error::from(e).context("deleting namespace")
    }

    fn container(name: &str, ready: bool, state: ContainerState) -> ContainerStatus {
        ContainerStatus { name: name.into(), ready, state: Some(state), ..Default::default() }
    }

    fn pod(name: &str, containers: Vec<ContainerStatus>) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            status: Some(PodStatus { container_statuses: Some(containers), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn diagnostics_report_only_unhealthy_containers() {
        let pods = vec![
            pod(
                "apiserver-1",
                vec![
                    container(
                        "apiserver",
                        false,
                        ContainerState {
                            waiting: Some(ContainerStateWaiting {
                                reason: Some("CrashLoopBackOff".into()),
                                message: Some("back-off 5m0s".into()),
                            }),
                            ..Default::default()
                        },
                    ),
                    container(
                        "sidecar",
                        true,
                        ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() },
                    ),
                ],
            ),
            pod(
                "apiserver-2",
                vec![
                    container(
                        "apiserver",
                        false,
                        ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                reason: Some("Error".into()),
                                exit_code: 137,
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ),
                    container(
                        "sidecar",
                        false,
                        ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() },
                    ),
                ],
            ),
        ];
        assert_eq!(
            container_diagnostics(&pods),
            vec![
                "pod/apiserver-1 container \"apiserver\" is waiting: CrashLoopBackOff - back-off 5m0s".to_string(),
                "pod/apiserver-2 container \"apiserver\" is terminated: Error (exit code 137)".to_string(),
                "pod/apiserver-2 container \"sidecar\" is not ready".to_string(),
            ]
        );
    }

    #[test]
    fn pods_without_status_yield_nothing() {
        assert!(container_diagnostics(&[Pod::default()]).is_empty());
    }

    #[test]
    fn observes_spec_and_status() {
        let labels: BTreeMap<String, String> = [("app".to_string(), "apiserver".to_string())].into_iter().collect();
        let d = Deployment {
            metadata: ObjectMeta {
                name: Some("apiserver".into()),
                namespace: Some("openshift-apiserver".into()),
                generation: Some(7),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
                    spec: None,
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(6),
                available_replicas: Some(2),
                updated_replicas: Some(1),
                ..Default::default()
            }),
        };
        let w = observe_deployment(&d);
        assert_eq!(w.qualified_name(), "apiserver.openshift-apiserver");
        assert_eq!((w.generation, w.observed_generation), (7, 6));
        assert_eq!((w.desired_replicas, w.available_replicas, w.updated_replicas), (Some(3), 2, 1));
        assert_eq!(w.template_labels, labels);
    }

    #[test]
    fn fresh_deployment_has_no_status() {
        let w = observe_deployment(&Deployment::default());
        assert_eq!(w.desired_replicas, None);
        assert_eq!(w.desired_replicas(), 1);
        assert_eq!(w.available_replicas, 0);
    }

    #[test]
    fn empty_selector_lists_everything() {
        assert!(list_params(&BTreeMap::new()).label_selector.is_none());
        let sel: BTreeMap<String, String> =
            [("node-role.kubernetes.io/master".to_string(), String::new())].into_iter().collect();
        assert_eq!(list_params(&sel).label_selector.as_deref(), Some("node-role.kubernetes.io/master="));
    }

    #[test]
    fn deleted_namespace_is_deleted() {
        assert_eq!(deletion_outcome(Ok(())).unwrap(), NamespaceDeletion::Deleted);
    }

    #[test]
    fn not_found_means_already_absent() {
        let res: Result<()> = Err(api_error(404, "NotFound"));
        assert_eq!(deletion_outcome(res).unwrap(), NamespaceDeletion::AlreadyAbsent);
    }

    #[test]
    fn other_failures_are_returned() {
        let res: Result<()> = Err(api_error(500, "InternalError"));
        let err = deletion_outcome(res).unwrap_err();
        assert!(format!("{:#}", err).contains("InternalError"));

        let res: Result<()> = Err(anyhow!("delete namespace: cancelled"));
        assert!(deletion_outcome(res).is_err());
    }
}
