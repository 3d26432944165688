//! Snapshot-based backup and restore
//!
//! A backup is an etcd snapshot written on the primary node plus a backend
//! snapshot of every control-plane node. Restore replays the etcd snapshot.
//! Snapshots are not cluster resources: teardown leaves them in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use kubeforge_common::types::{ClusterId, ClusterInfrastructure, NodeInfo, Tags};
use kubeforge_common::{Error, Result, CLUSTER_TAG, MANAGED_BY_TAG, MANAGED_BY_VALUE};

use crate::backend::Backend;
use crate::bootstrap::{commands, RemoteShell};

/// Tag carrying the backup id on node snapshots
pub const BACKUP_TAG: &str = "kubeforge.io/backup";

/// A completed backup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Backup id
    pub id: Uuid,
    /// Cluster the backup belongs to
    pub cluster: ClusterId,
    /// When the etcd snapshot was taken
    pub created_at: DateTime<Utc>,
    /// etcd snapshot location on the primary node
    pub snapshot_path: String,
    /// Backend snapshots of the control-plane nodes
    pub snapshot_ids: Vec<String>,
}

/// Takes and restores backups through the primary node
pub struct BackupManager<'a> {
    backend: &'a dyn Backend,
}

impl<'a> BackupManager<'a> {
    /// Manager over a backend
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    fn primary<'i>(cluster: &ClusterId, infra: &'i ClusterInfrastructure) -> Result<&'i NodeInfo> {
        infra
            .primary()
            .ok_or_else(|| Error::not_found("control-plane node", format!("{}-cp-0", cluster.name)))
    }

    /// Snapshot etcd and every control-plane node
    #[instrument(skip(self, infra), fields(cluster = %cluster))]
    pub async fn backup(
        &self,
        cluster: &ClusterId,
        infra: &ClusterInfrastructure,
    ) -> Result<BackupRecord> {
        let primary = Self::primary(cluster, infra)?;
        let id = Uuid::new_v4();
        let snapshot_path = format!("{}/{}-{}.db", commands::SNAPSHOT_DIR, cluster.name, id);

        RemoteShell::new(self.backend)
            .run_labeled(
                primary,
                &commands::etcd_snapshot(&snapshot_path),
                "etcdctl snapshot save",
            )
            .await?;

        let mut tags = Tags::new();
        tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());
        tags.insert(CLUSTER_TAG.to_string(), cluster.name.clone());
        tags.insert(BACKUP_TAG.to_string(), id.to_string());

        let mut snapshot_ids = Vec::with_capacity(infra.control_plane.len());
        for node in &infra.control_plane {
            snapshot_ids.push(self.backend.snapshot_node(&node.id, &tags).await?);
        }

        info!(
            cluster = %cluster,
            backup = %id,
            snapshots = snapshot_ids.len(),
            "Backup complete"
        );
        Ok(BackupRecord {
            id,
            cluster: cluster.clone(),
            created_at: Utc::now(),
            snapshot_path,
            snapshot_ids,
        })
    }

    /// Restore etcd from a backup's snapshot
    #[instrument(skip(self, infra, record), fields(cluster = %record.cluster, backup = %record.id))]
    pub async fn restore(&self, infra: &ClusterInfrastructure, record: &BackupRecord) -> Result<()> {
        let primary = Self::primary(&record.cluster, infra)?;
        RemoteShell::new(self.backend)
            .run_labeled(
                primary,
                &commands::etcd_restore(&record.snapshot_path),
                "etcdutl snapshot restore",
            )
            .await?;
        info!(cluster = %record.cluster, backup = %record.id, "Restore complete");
        Ok(())
    }
}
