//! Steward kubehub: kube client bootstrap and the watchers that turn cluster
//! changes into work-queue keys.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use steward_store::WorkQueue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client, inferred from kubeconfig or the in-cluster environment on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    Ok(CLIENT.get_or_init(|| client).clone())
}

/// Only the target namespace object itself.
pub fn namespace_watch_config(namespace: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("metadata.name={}", namespace))
}

/// Number of objects an event touches; `Restarted` carries the full relist.
pub fn event_objects<K>(ev: &Event<K>) -> usize {
    match ev {
        Event::Applied(_) | Event::Deleted(_) => 1,
        Event::Restarted(list) => list.len(),
    }
}

/// Enqueue `key` for every event on `api` until the stream ends or `cancel` fires.
/// Watch errors are logged and the watcher retries with backoff.
pub async fn watch_into_queue<K>(
    api: Api<K>,
    cfg: watcher::Config,
    queue: WorkQueue,
    key: String,
    source: &'static str,
    cancel: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(source, key = %key, "watcher started");
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(ev)) => {
                let n = event_objects(&ev);
                counter!("watch_events_total", 1u64, "source" => source);
                debug!(source, objects = n, "watch event");
                queue.add(&key);
            }
            Some(Err(e)) => {
                counter!("watch_errors_total", 1u64, "source" => source);
                warn!(source, error = %e, "watch error; retrying");
            }
            None => {
                warn!(source, "watcher stream ended");
                break;
            }
        }
    }
}

/// Enqueue `key` every `period` until cancelled.
pub async fn resync_loop(queue: WorkQueue, key: String, period: Duration, cancel: CancellationToken) {
    if period.is_zero() {
        return;
    }
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                debug!(key = %key, "resync");
                queue.add(&key);
            }
        }
    }
}

/// Watch the Deployments in `namespace` and the namespace object itself, and
/// resync periodically. Every trigger maps to the same `key`.
pub fn spawn_triggers(
    client: Client,
    namespace: &str,
    queue: &WorkQueue,
    key: &str,
    resync: Duration,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let namespaces: Api<Namespace> = Api::all(client);
    vec![
        tokio::spawn(watch_into_queue(
            deployments,
            watcher::Config::default(),
            queue.clone(),
            key.to_string(),
            "deployments",
            cancel.clone(),
        )),
        tokio::spawn(watch_into_queue(
            namespaces,
            namespace_watch_config(namespace),
            queue.clone(),
            key.to_string(),
            "namespace",
            cancel.clone(),
        )),
        tokio::spawn(resync_loop(queue.clone(), key.to_string(), resync, cancel.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_watch_is_scoped_by_name() {
        let cfg = namespace_watch_config("openshift-apiserver");
        assert_eq!(cfg.field_selector.as_deref(), Some("metadata.name=openshift-apiserver"));
        assert!(cfg.label_selector.is_none());
    }

    #[test]
    fn restart_counts_every_object() {
        let ns = Namespace::default();
        assert_eq!(event_objects(&Event::Applied(ns.clone())), 1);
        assert_eq!(event_objects(&Event::Restarted(vec![ns.clone(), ns.clone(), ns])), 3);
        assert_eq!(event_objects::<Namespace>(&Event::Restarted(vec![])), 0);
    }

    #[tokio::test]
    async fn resync_keeps_requeueing_until_cancelled() {
        let q = WorkQueue::with_capacity("resync", 4);
        let cancel = CancellationToken::new();
        let h = tokio::spawn(resync_loop(q.clone(), "key".into(), Duration::from_millis(10), cancel.clone()));
        for _ in 0..2 {
            let k = tokio::time::timeout(Duration::from_secs(1), q.next()).await.unwrap().unwrap();
            assert_eq!(k, "key");
            q.done(&k);
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn zero_period_disables_resync() {
        let q = WorkQueue::with_capacity("resync", 4);
        resync_loop(q.clone(), "key".into(), Duration::ZERO, CancellationToken::new()).await;
        assert!(q.is_empty());
    }
}
