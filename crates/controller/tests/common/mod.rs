#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use steward_controller::{Collaborators, WorkloadController, WorkloadControllerConfig};
use steward_core::{
    Delegate, EventSink, ManagementIntent, NamespaceDeleter, NamespaceDeletion, OperatorStatus, PodDiagnostics,
    PreconditionResult, StateObserver, StatusMutation, StatusStore, StatusUpdate, SyncContext, SyncOutcome,
    WorkloadObservation, WorkloadState,
};
use steward_store::{MemoryStatusStore, VersionRecorder};

pub const PREFIX: &str = "APIServer";
pub const TARGET_NS: &str = "openshift-apiserver";

pub fn config() -> WorkloadControllerConfig {
    WorkloadControllerConfig {
        name: "APIServer".into(),
        target_namespace: TARGET_NS.into(),
        target_operand_version: "4.2.0".into(),
        operand_name_prefix: "openshift-apiserver".into(),
        conditions_prefix: PREFIX.into(),
    }
}

pub fn workload(desired: Option<i32>, available: i32, updated: i32) -> WorkloadState {
    WorkloadState {
        name: "apiserver".into(),
        namespace: TARGET_NS.into(),
        generation: 2,
        observed_generation: 2,
        desired_replicas: desired,
        available_replicas: available,
        updated_replicas: updated,
        template_labels: [("app".to_string(), "openshift-apiserver".to_string())].into_iter().collect(),
    }
}

/// Delegate whose answers are scripted per test. Outcomes are rebuilt each
/// call because errors are not `Clone`.
pub struct ScriptedDelegate {
    pub precondition: Mutex<Option<Result<bool, String>>>,
    pub observation: Mutex<WorkloadObservation>,
    pub config_at_highest_generation: Mutex<bool>,
    pub sync_errors: Mutex<Vec<String>>,
    pub precondition_calls: AtomicUsize,
    pub sync_calls: AtomicUsize,
}

impl ScriptedDelegate {
    pub fn healthy(w: WorkloadState) -> Self {
        Self {
            precondition: Mutex::new(Some(Ok(true))),
            observation: Mutex::new(WorkloadObservation::Present(w)),
            config_at_highest_generation: Mutex::new(true),
            sync_errors: Mutex::new(Vec::new()),
            precondition_calls: AtomicUsize::new(0),
            sync_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_precondition(&self, v: Result<bool, &str>) {
        *self.precondition.lock().unwrap() = Some(v.map_err(|e| e.to_string()));
    }

    pub fn set_sync_errors(&self, errs: &[&str]) {
        *self.sync_errors.lock().unwrap() = errs.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait::async_trait]
impl Delegate for ScriptedDelegate {
    async fn precondition_fulfilled(&self, _ctx: &SyncContext) -> PreconditionResult {
        self.precondition_calls.fetch_add(1, Ordering::SeqCst);
        match self.precondition.lock().unwrap().clone() {
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(true),
        }
    }

    async fn sync(&self, _ctx: &SyncContext) -> SyncOutcome {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        SyncOutcome::new(
            self.observation.lock().unwrap().clone(),
            *self.config_at_highest_generation.lock().unwrap(),
            self.sync_errors.lock().unwrap().iter().map(|e| anyhow!(e.clone())).collect(),
        )
    }
}

pub enum DeleteBehaviour {
    Deleted,
    AlreadyAbsent,
    Fail(&'static str),
}

pub struct FakeNamespaces {
    pub behaviour: DeleteBehaviour,
    pub calls: Mutex<Vec<String>>,
}

impl FakeNamespaces {
    pub fn new(behaviour: DeleteBehaviour) -> Self { Self { behaviour, calls: Mutex::new(Vec::new()) } }
    pub fn calls(&self) -> Vec<String> { self.calls.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl NamespaceDeleter for FakeNamespaces {
    async fn delete_namespace(&self, _ctx: &SyncContext, namespace: &str) -> Result<NamespaceDeletion> {
        self.calls.lock().unwrap().push(namespace.to_string());
        match self.behaviour {
            DeleteBehaviour::Deleted => Ok(NamespaceDeletion::Deleted),
            DeleteBehaviour::AlreadyAbsent => Ok(NamespaceDeletion::AlreadyAbsent),
            DeleteBehaviour::Fail(msg) => Err(anyhow!(msg)),
        }
    }
}

pub struct FakePods {
    pub result: Result<Vec<String>, String>,
    pub calls: AtomicUsize,
}

impl FakePods {
    pub fn ok(states: &[&str]) -> Self {
        Self { result: Ok(states.iter().map(|s| s.to_string()).collect()), calls: AtomicUsize::new(0) }
    }
    pub fn failing(msg: &str) -> Self { Self { result: Err(msg.to_string()), calls: AtomicUsize::new(0) } }
}

#[async_trait::async_trait]
impl PodDiagnostics for FakePods {
    async fn pod_containers_status(&self, _ctx: &SyncContext, _w: &WorkloadState) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map_err(|e| anyhow!(e))
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    pub warnings: Mutex<Vec<(String, String)>>,
}

impl EventSink for RecordingEvents {
    fn warn(&self, reason: &str, message: &str) {
        self.warnings.lock().unwrap().push((reason.to_string(), message.to_string()));
    }
}

/// Intent source that cannot be read.
pub struct BrokenObserver;

#[async_trait::async_trait]
impl StateObserver for BrokenObserver {
    async fn management_intent(&self, _ctx: &SyncContext) -> Result<ManagementIntent> {
        Err(anyhow!("operator config not found"))
    }
    fn current_status(&self) -> Arc<OperatorStatus> { Arc::new(OperatorStatus::default()) }
}

/// Status store that rejects every write, counting attempts.
#[derive(Default)]
pub struct RejectingStore {
    pub attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl StatusStore for RejectingStore {
    async fn update_status(&self, _ctx: &SyncContext, _m: &[StatusMutation]) -> Result<StatusUpdate> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("conflict: the object has been modified"))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStatusStore>,
    pub versions: Arc<VersionRecorder>,
    pub delegate: Arc<ScriptedDelegate>,
    pub namespaces: Arc<FakeNamespaces>,
    pub pods: Arc<FakePods>,
    pub events: Arc<RecordingEvents>,
}

impl Harness {
    pub fn new(intent: ManagementIntent, delegate: ScriptedDelegate) -> Self {
        Self {
            store: Arc::new(MemoryStatusStore::new(intent)),
            versions: Arc::new(VersionRecorder::new()),
            delegate: Arc::new(delegate),
            namespaces: Arc::new(FakeNamespaces::new(DeleteBehaviour::Deleted)),
            pods: Arc::new(FakePods::ok(&[])),
            events: Arc::new(RecordingEvents::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            observer: self.store.clone(),
            status: self.store.clone(),
            namespaces: self.namespaces.clone(),
            delegate: self.delegate.clone(),
            versions: self.versions.clone(),
            pods: self.pods.clone(),
            events: self.events.clone(),
        }
    }

    pub fn controller(&self) -> WorkloadController { WorkloadController::new(config(), self.collaborators()) }

    pub fn status(&self) -> Arc<OperatorStatus> { self.store.current_status() }
}

pub fn ctx() -> SyncContext { SyncContext::new("key") }
