//! Steward store: in-RAM status document with atomic snapshot swaps, the
//! operand version recorder, and the work queue that serializes passes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use metrics::counter;
use steward_core::{
    apply_mutations, ManagementIntent, OperatorStatus, StateObserver, StatusMutation, StatusStore, StatusUpdate,
    SyncContext, VersionSink,
};
use tokio::sync::watch;
use tracing::{debug, info};

pub mod queue;

pub use queue::{backoff_for, WorkQueue};

/// Status document held in memory. Readers load a complete snapshot; a write
/// swaps in a new one, so no reader sees a half-applied mutation list.
pub struct MemoryStatusStore {
    intent: ArcSwap<ManagementIntent>,
    status: ArcSwap<OperatorStatus>,
    write_lock: Mutex<()>,
    updates: AtomicU64,
    revision_tx: watch::Sender<u64>,
}

impl MemoryStatusStore {
    pub fn new(intent: ManagementIntent) -> Self {
        let (revision_tx, _) = watch::channel(0u64);
        Self {
            intent: ArcSwap::from_pointee(intent),
            status: ArcSwap::from_pointee(OperatorStatus::default()),
            write_lock: Mutex::new(()),
            updates: AtomicU64::new(0),
            revision_tx,
        }
    }

    pub fn set_management_intent(&self, intent: ManagementIntent) {
        info!(state = %intent, "management state set");
        self.intent.store(Arc::new(intent));
    }

    /// Number of `update_status` calls, whether or not they changed anything.
    pub fn update_calls(&self) -> u64 { self.updates.load(Ordering::Relaxed) }

    /// Revision of the published document; bumps only on effective writes.
    pub fn revision(&self) -> u64 { *self.revision_tx.borrow() }

    /// Notified on every effective write.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.revision_tx.subscribe() }
}

impl Default for MemoryStatusStore {
    fn default() -> Self { Self::new(ManagementIntent::Managed) }
}

#[async_trait::async_trait]
impl StateObserver for MemoryStatusStore {
    async fn management_intent(&self, _ctx: &SyncContext) -> Result<ManagementIntent> {
        Ok((**self.intent.load()).clone())
    }

    fn current_status(&self) -> Arc<OperatorStatus> { self.status.load_full() }
}

#[async_trait::async_trait]
impl StatusStore for MemoryStatusStore {
    async fn update_status(&self, ctx: &SyncContext, mutations: &[StatusMutation]) -> Result<StatusUpdate> {
        if ctx.is_cancelled() {
            return Err(anyhow!("status update for {} cancelled", ctx.key()));
        }
        let _guard = self.write_lock.lock().map_err(|_| anyhow!("status store lock poisoned"))?;
        self.updates.fetch_add(1, Ordering::Relaxed);
        let old = self.status.load_full();
        let new = Arc::new(apply_mutations(&old, mutations, chrono::Utc::now()));
        let changed = *new != *old;
        if changed {
            self.status.store(Arc::clone(&new));
            self.revision_tx.send_modify(|r| *r = r.saturating_add(1));
            counter!("status_store_writes_total", 1u64);
            debug!(key = %ctx.key(), mutations = mutations.len(), "status document swapped");
        }
        Ok(StatusUpdate { old, new, changed })
    }
}

/// Records operand versions once a rollout has fully landed.
#[derive(Debug, Default)]
pub struct VersionRecorder {
    versions: Mutex<BTreeMap<String, String>>,
}

impl VersionRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, operand_key: &str) -> Option<String> {
        self.versions.lock().ok().and_then(|v| v.get(operand_key).cloned())
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.versions.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl VersionSink for VersionRecorder {
    fn set_version(&self, operand_key: &str, version: &str) {
        let Ok(mut versions) = self.versions.lock() else { return };
        let prev = versions.insert(operand_key.to_string(), version.to_string());
        if prev.as_deref() != Some(version) {
            counter!("operand_version_set_total", 1u64);
            info!(operand = %operand_key, version = %version, previous = ?prev, "operand version recorded");
        }
    }
}
