//! In-process cluster registry and supervised operations
//!
//! Records are kept in a `DashMap` keyed by [`ClusterId`]. Every lifecycle
//! operation first takes the cluster's operation lock, so at most one
//! operation mutates a given cluster at a time while unrelated clusters
//! proceed in parallel.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kubeforge_common::kubeconfig::Kubeconfig;
use kubeforge_common::types::{Cluster, ClusterId, ClusterInfrastructure, ClusterSpec, ClusterStatus};
use kubeforge_common::{Error, Result};

use crate::backup::BackupRecord;

/// Everything kept about one cluster
#[derive(Clone, Debug)]
pub struct ClusterRecord {
    /// Spec, updated by scaling
    pub spec: ClusterSpec,
    /// Cluster record
    pub cluster: Cluster,
    /// Cached topology; the backend stays the source of truth
    pub infrastructure: Option<ClusterInfrastructure>,
    /// Client access descriptor from provisioning
    pub kubeconfig: Option<Kubeconfig>,
    /// Backups, oldest first
    pub backups: Vec<BackupRecord>,
    /// Warnings from the last teardown or rollback
    pub warnings: Vec<String>,
}

impl ClusterRecord {
    /// Fresh record for a cluster about to be created
    pub fn new(spec: ClusterSpec, cluster: Cluster) -> Self {
        Self {
            spec,
            cluster,
            infrastructure: None,
            kubeconfig: None,
            backups: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Thread-safe registry of clusters with per-cluster operation locks
#[derive(Default)]
pub struct ClusterRegistry {
    records: DashMap<ClusterId, ClusterRecord>,
    locks: DashMap<ClusterId, Arc<Mutex<()>>>,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster about to be created
    ///
    /// A cluster in `Error` may be created again; any other existing record
    /// is a conflict.
    pub fn register(&self, record: ClusterRecord) -> Result<()> {
        let id = record.cluster.id.clone();
        match self.records.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if existing.cluster.status != ClusterStatus::Error {
                    return Err(Error::validation_for(
                        &existing.cluster.name,
                        format!(
                            "cluster {} already exists ({})",
                            existing.cluster.id, existing.cluster.status
                        ),
                    ));
                }
                existing.cluster.transition(ClusterStatus::Creating)?;
                let backups = std::mem::take(&mut existing.backups);
                *existing = ClusterRecord { backups, ..record };
                info!(cluster = %existing.cluster.id, "Re-creating failed cluster");
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!(cluster = %record.cluster.id, "Registered cluster");
                entry.insert(record);
            }
        }
        Ok(())
    }

    /// A copy of a cluster's record
    pub fn get(&self, id: &ClusterId) -> Option<ClusterRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Whether a cluster is registered
    pub fn contains(&self, id: &ClusterId) -> bool {
        self.records.contains_key(id)
    }

    /// Mutate a record in place
    pub fn update<R>(&self, id: &ClusterId, f: impl FnOnce(&mut ClusterRecord) -> R) -> Result<R> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))?;
        Ok(f(&mut record))
    }

    /// Drop a record and release its operation lock
    ///
    /// The lock entry goes too unless another operation is already waiting
    /// on it, so deleted clusters leave nothing behind in the registry.
    pub fn remove(&self, id: &ClusterId, guard: OwnedMutexGuard<()>) -> Option<ClusterRecord> {
        let record = self.records.remove(id).map(|(_, r)| r);
        drop(guard);
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        record
    }

    /// Number of per-cluster operation locks held in the registry
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Every cluster, ordered by id
    pub fn list(&self) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = self.records.iter().map(|r| r.cluster.clone()).collect();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        clusters
    }

    /// Number of registered clusters
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no clusters are registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take a cluster's operation lock, waiting for the current holder
    pub async fn lock(&self, id: &ClusterId) -> OwnedMutexGuard<()> {
        // Clone the Arc out so no map guard is held across the await
        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Take a cluster's operation lock if nobody holds it
    pub fn try_lock(&self, id: &ClusterId) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().map_err(|_| {
            Error::validation_for(
                &id.name,
                format!("another operation is in progress on {}", id),
            )
        })
    }
}

/// A lifecycle operation running as its own task
///
/// Dropping the handle detaches the task; it keeps running to completion.
pub struct OperationHandle<T> {
    cluster: ClusterId,
    cancel: CancellationToken,
    task: JoinHandle<Result<T>>,
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("cluster", &self.cluster)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl<T> OperationHandle<T> {
    pub(crate) fn new(cluster: ClusterId, cancel: CancellationToken, task: JoinHandle<Result<T>>) -> Self {
        Self {
            cluster,
            cancel,
            task,
        }
    }

    /// Cluster the operation acts on
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster
    }

    /// Ask the operation to stop at its next wait point
    pub fn cancel(&self) {
        info!(cluster = %self.cluster, "Cancelling operation");
        self.cancel.cancel();
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the operation's result
    pub async fn wait(self) -> Result<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::cancelled(format!("operation on {}", self.cluster))),
            Err(e) => Err(Error::internal_with_context(
                "operation",
                format!("task for {} failed: {}", self.cluster, e),
            )),
        }
    }
}
