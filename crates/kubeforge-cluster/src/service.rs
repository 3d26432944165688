//! Cluster lifecycle service
//!
//! [`ClusterManager`] is the surface callers use: create, delete, update
//! (scale), get, list, backup, restore, health, metrics and addons. It owns
//! the backend handle, the registry and the tracker store, and runs every
//! mutating operation under the cluster's operation lock.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use kubeforge_common::config::OrchestratorConfig;
use kubeforge_common::kubeconfig::Kubeconfig;
use kubeforge_common::telemetry::{init_tracing, TelemetryConfig};
use kubeforge_common::types::{
    Cluster, ClusterId, ClusterInfrastructure, ClusterSpec, ClusterStatus, NodeInfo,
};
use kubeforge_common::{Error, Result};

use crate::addons::{self, Addon, AddonInstaller, AddonStatus};
use crate::backend::Backend;
use crate::backup::{BackupManager, BackupRecord};
use crate::discovery::{discover, discover_infrastructure};
use crate::health::{ClusterMetrics, HealthChecker, HealthReport};
use crate::provision::{metadata, ProvisioningPipeline};
use crate::registry::{ClusterRecord, ClusterRegistry, OperationHandle};
use crate::scale::{self, ScaleRequest, Scaler};
use crate::teardown::{TeardownOrchestrator, TeardownReport};
use crate::tracker::TrackerStore;

/// Metadata key holding the id of the most recent backup
const LAST_BACKUP: &str = "lastBackup";

/// How a host process starts a [`ClusterManager`]
#[derive(Clone, Debug, Default)]
pub struct ManagerOptions {
    /// Configuration file, ahead of `KUBEFORGE_CONFIG` and `~/.kubeforge/config.yaml`
    pub config_path: Option<PathBuf>,
    /// Install the global tracing subscriber first
    pub telemetry: Option<TelemetryConfig>,
}

/// Lifecycle operations over one backend
pub struct ClusterManager {
    backend: Arc<dyn Backend>,
    config: Arc<OrchestratorConfig>,
    store: Arc<TrackerStore>,
    registry: Arc<ClusterRegistry>,
    shutdown: CancellationToken,
}

impl ClusterManager {
    /// Manager persisting trackers under the configured state directory
    pub fn new(backend: Arc<dyn Backend>, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let store = TrackerStore::new(config.state_dir()?);
        Ok(Self::with_store(backend, config, store))
    }

    /// Start a manager for a host process
    ///
    /// Installs tracing when asked, resolves the configuration file, and
    /// checks the backend's credentials before any cluster is touched.
    pub async fn start(backend: Arc<dyn Backend>, options: ManagerOptions) -> Result<Self> {
        if let Some(telemetry) = options.telemetry {
            if let Err(e) = init_tracing(telemetry) {
                warn!(error = %e, "Keeping the existing tracing subscriber");
            }
        }
        let config = OrchestratorConfig::load(options.config_path.as_deref())?;
        let manager = Self::new(backend, config)?;
        manager.verify_backend().await?;
        info!(backend = %manager.backend_name(), "Cluster manager started");
        Ok(manager)
    }

    /// Manager with an explicit tracker store
    pub fn with_store(
        backend: Arc<dyn Backend>,
        config: OrchestratorConfig,
        store: TrackerStore,
    ) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            store: Arc::new(store),
            registry: Arc::new(ClusterRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Backend identifier
    pub fn backend_name(&self) -> String {
        self.backend.name()
    }

    /// Active configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The cluster registry
    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Check credentials and permissions against the backend
    pub async fn verify_backend(&self) -> Result<()> {
        verify(self.backend.as_ref()).await
    }

    /// Cancel every in-flight operation
    ///
    /// Operations stop at their next wait point; a cancelled creation still
    /// rolls back what it created.
    pub fn shutdown(&self) {
        info!(backend = %self.backend.name(), "Shutting down cluster manager");
        self.shutdown.cancel();
    }

    // =========================================================================
    // Create / delete
    // =========================================================================

    /// Start provisioning a cluster
    ///
    /// The spec is validated, the cluster's operation lock taken and the
    /// cluster registered in `Creating` before this returns; the pipeline
    /// itself runs as a separate task that holds the lock until it finishes.
    /// An operation issued right after `create` therefore waits for it.
    #[instrument(skip_all, fields(cluster = %spec.id()))]
    pub fn create(&self, spec: ClusterSpec) -> Result<OperationHandle<Cluster>> {
        spec.validate()?;
        let id = spec.id();
        let backend_name = self.backend.name();
        if id.backend != backend_name {
            return Err(Error::configuration_field(
                &spec.name,
                "backend",
                format!("spec targets '{}' but this manager runs '{}'", id.backend, backend_name),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled(format!("create {}", id)));
        }

        let guard = self.registry.try_lock(&id)?;
        let cluster = Cluster::new(&spec, self.backend.region());
        self.registry.register(ClusterRecord::new(spec.clone(), cluster))?;
        info!(cluster = %id, "Cluster registered, provisioning");

        let cancel = self.shutdown.child_token();
        let backend = self.backend.clone();
        let config = self.config.clone();
        let store = self.store.clone();
        let registry = self.registry.clone();
        let task_cancel = cancel.clone();
        let task_id = id.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;

            if let Err(e) = verify(backend.as_ref()).await {
                registry.update(&task_id, |r| r.cluster.fail(&e))?;
                return Err(e);
            }

            let pipeline = ProvisioningPipeline::new(backend.as_ref(), &config, &task_cancel)
                .with_store(&store);
            match pipeline.provision(&spec).await {
                Ok(provisioned) => {
                    let cluster = provisioned.cluster.clone();
                    registry.update(&task_id, |r| {
                        r.cluster = provisioned.cluster;
                        r.infrastructure = Some(provisioned.infrastructure);
                        r.kubeconfig = Some(provisioned.kubeconfig);
                        r.warnings.clear();
                    })?;
                    Ok(cluster)
                }
                Err(failure) => {
                    let warnings = failure.teardown.warnings();
                    registry.update(&task_id, |r| {
                        r.cluster = failure.cluster;
                        r.infrastructure = None;
                        r.warnings = warnings;
                    })?;
                    Err(failure.error)
                }
            }
        });

        Ok(OperationHandle::new(id, cancel, task))
    }

    /// Tear down every resource of a cluster
    ///
    /// The persisted tracker drives teardown; without one the resources are
    /// discovered by tag. Individual deletion failures are returned as
    /// warnings in the report, not as an error.
    #[instrument(skip(self), fields(cluster = %id))]
    pub async fn delete(&self, id: &ClusterId) -> Result<TeardownReport> {
        let guard = self.registry.lock(id).await;

        let tracker = match self.store.load(id)? {
            Some(tracker) => tracker,
            None => {
                info!(cluster = %id, "No persisted tracker, discovering resources by tag");
                discover(self.backend.as_ref(), &id.name).await?
            }
        };
        if tracker.is_empty() && !self.registry.contains(id) {
            return Err(Error::not_found("cluster", id.to_string()));
        }

        let cancel = self.shutdown.child_token();
        let report = TeardownOrchestrator::new(self.backend.as_ref(), &self.config, &cancel)
            .teardown(&tracker)
            .await;

        if report.is_clean() {
            self.store.remove(id)?;
        } else {
            self.store.save(id, &tracker)?;
            for warning in report.warnings() {
                warn!(cluster = %id, warning = %warning, "Teardown left a resource behind");
            }
        }
        self.registry.remove(id, guard);
        info!(
            cluster = %id,
            deleted = report.deleted.len(),
            warnings = report.errors.len(),
            "Cluster deleted"
        );
        Ok(report)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// A cluster's record
    pub fn get(&self, id: &ClusterId) -> Result<Cluster> {
        self.record(id).map(|r| r.cluster)
    }

    /// Every known cluster
    pub fn list(&self) -> Vec<Cluster> {
        self.registry.list()
    }

    /// Client access descriptor of a provisioned cluster
    pub fn kubeconfig(&self, id: &ClusterId) -> Result<Kubeconfig> {
        self.record(id)?
            .kubeconfig
            .ok_or_else(|| Error::not_found("kubeconfig", id.to_string()))
    }

    /// Current node readiness
    pub async fn health(&self, id: &ClusterId) -> Result<HealthReport> {
        let record = self.record(id)?;
        let primary = self.primary(&record).await?;
        let cancel = self.shutdown.child_token();
        HealthChecker::new(self.backend.as_ref(), &self.config, &cancel)
            .check(&primary)
            .await
    }

    /// Per-node resource usage
    ///
    /// Needs the metrics-server addon or an equivalent metrics API.
    pub async fn metrics(&self, id: &ClusterId) -> Result<ClusterMetrics> {
        let record = self.record(id)?;
        let primary = self.primary(&record).await?;
        let cancel = self.shutdown.child_token();
        HealthChecker::new(self.backend.as_ref(), &self.config, &cancel)
            .metrics(&primary)
            .await
    }

    // =========================================================================
    // Update (scale)
    // =========================================================================

    /// Scale control-plane and node-group replica counts
    ///
    /// The cluster moves `Running -> Updating -> Running`, or to `Error` when
    /// a node cannot be added or removed.
    #[instrument(skip(self, request), fields(cluster = %id))]
    pub async fn update(&self, id: &ClusterId, request: ScaleRequest) -> Result<Cluster> {
        let _guard = self.registry.lock(id).await;
        let record = self.running_record(id)?;
        let mut infra = self.infrastructure(&record).await?;

        let plan = scale::plan(&record.spec, &infra, &request)?;
        if plan.is_empty() {
            info!(cluster = %id, "Cluster already at requested size");
            return Ok(record.cluster);
        }

        let mut tracker = match self.store.load(id)? {
            Some(tracker) => tracker,
            None => discover(self.backend.as_ref(), &id.name).await?,
        };
        self.begin_update(id)?;

        let cancel = self.shutdown.child_token();
        let result = Scaler::new(self.backend.as_ref(), &self.config, &cancel)
            .apply(&record.spec, &mut infra, &mut tracker, plan)
            .await;
        if let Err(e) = self.store.save(id, &tracker) {
            warn!(cluster = %id, error = %e, "Failed to persist resource tracker");
        }

        let cluster = self.registry.update(id, |r| {
            r.infrastructure = Some(infra.clone());
            r.cluster
                .set_metadata(metadata::CONTROL_PLANE_NODES, infra.control_plane.len().to_string());
            r.cluster
                .set_metadata(metadata::WORKER_NODES, infra.workers.len().to_string());
            match &result {
                Ok(_) => {
                    apply_request(&mut r.spec, &request);
                    if let Err(e) = r.cluster.transition(ClusterStatus::Running) {
                        warn!(cluster = %id, error = %e, "Unexpected status after scaling");
                    }
                }
                Err(e) => r.cluster.fail(e),
            }
            r.cluster.clone()
        })?;

        let outcome = result?;
        info!(
            cluster = %id,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "Cluster scaled"
        );
        Ok(cluster)
    }

    // =========================================================================
    // Backup / restore
    // =========================================================================

    /// Snapshot etcd and the control-plane nodes
    #[instrument(skip(self), fields(cluster = %id))]
    pub async fn backup(&self, id: &ClusterId) -> Result<BackupRecord> {
        let _guard = self.registry.lock(id).await;
        let record = self.running_record(id)?;
        let infra = self.infrastructure(&record).await?;

        let backup = BackupManager::new(self.backend.as_ref())
            .backup(id, &infra)
            .await?;
        self.registry.update(id, |r| {
            r.cluster.set_metadata(LAST_BACKUP, backup.id.to_string());
            r.backups.push(backup.clone());
        })?;
        Ok(backup)
    }

    /// Backups taken of a cluster, oldest first
    pub fn backups(&self, id: &ClusterId) -> Result<Vec<BackupRecord>> {
        self.record(id).map(|r| r.backups)
    }

    /// Restore etcd from a backup
    #[instrument(skip(self), fields(cluster = %id, backup = %backup_id))]
    pub async fn restore(&self, id: &ClusterId, backup_id: Uuid) -> Result<Cluster> {
        let _guard = self.registry.lock(id).await;
        let record = self.running_record(id)?;
        let backup = record
            .backups
            .iter()
            .find(|b| b.id == backup_id)
            .cloned()
            .ok_or_else(|| Error::not_found("backup", backup_id.to_string()))?;
        let infra = self.infrastructure(&record).await?;

        self.begin_update(id)?;
        let result = BackupManager::new(self.backend.as_ref())
            .restore(&infra, &backup)
            .await;
        self.finish_update(id, result.as_ref().err(), true)?;
        result?;
        self.get(id)
    }

    // =========================================================================
    // Addons
    // =========================================================================

    /// Catalog addons with their install state
    pub fn list_addons(&self, id: &ClusterId) -> Result<Vec<AddonStatus>> {
        self.record(id).map(|r| addons::list_addons(&r.cluster))
    }

    /// Install an addon
    ///
    /// A failed install leaves the cluster `Running`.
    #[instrument(skip(self), fields(cluster = %id, addon = %addon))]
    pub async fn install_addon(&self, id: &ClusterId, addon: Addon) -> Result<()> {
        let _guard = self.registry.lock(id).await;
        let record = self.running_record(id)?;
        if addons::is_installed(&record.cluster, addon) {
            info!(cluster = %id, addon = %addon, "Addon already installed");
            return Ok(());
        }
        let primary = self.primary(&record).await?;

        self.begin_update(id)?;
        let result = AddonInstaller::new(self.backend.as_ref())
            .install(&primary, addon)
            .await;
        if result.is_ok() {
            self.registry
                .update(id, |r| addons::mark_installed(&mut r.cluster, addon))?;
        }
        self.finish_update(id, result.as_ref().err(), false)?;
        result
    }

    /// Uninstall an addon
    #[instrument(skip(self), fields(cluster = %id, addon = %addon))]
    pub async fn uninstall_addon(&self, id: &ClusterId, addon: Addon) -> Result<()> {
        let _guard = self.registry.lock(id).await;
        let record = self.running_record(id)?;
        if !addons::is_installed(&record.cluster, addon) {
            return Err(Error::not_found("addon", addon.name()));
        }
        let primary = self.primary(&record).await?;

        self.begin_update(id)?;
        let result = AddonInstaller::new(self.backend.as_ref())
            .uninstall(&primary, addon)
            .await;
        if result.is_ok() {
            self.registry
                .update(id, |r| addons::mark_removed(&mut r.cluster, addon))?;
        }
        self.finish_update(id, result.as_ref().err(), false)?;
        result
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn record(&self, id: &ClusterId) -> Result<ClusterRecord> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))
    }

    fn running_record(&self, id: &ClusterId) -> Result<ClusterRecord> {
        let record = self.record(id)?;
        if record.cluster.status != ClusterStatus::Running {
            return Err(Error::validation_for(
                &record.cluster.name,
                format!(
                    "cluster {} is {}, operation needs Running",
                    id, record.cluster.status
                ),
            ));
        }
        Ok(record)
    }

    /// Cached topology, discovered from the backend when missing
    async fn infrastructure(&self, record: &ClusterRecord) -> Result<ClusterInfrastructure> {
        if let Some(ref infra) = record.infrastructure {
            return Ok(infra.clone());
        }
        let infra = discover_infrastructure(self.backend.as_ref(), &record.cluster.name).await?;
        self.registry
            .update(&record.cluster.id, |r| r.infrastructure = Some(infra.clone()))?;
        Ok(infra)
    }

    async fn primary(&self, record: &ClusterRecord) -> Result<NodeInfo> {
        self.infrastructure(record)
            .await?
            .primary()
            .cloned()
            .ok_or_else(|| {
                Error::not_found("control-plane node", format!("{}-cp-0", record.cluster.name))
            })
    }

    fn begin_update(&self, id: &ClusterId) -> Result<()> {
        self.registry
            .update(id, |r| r.cluster.transition(ClusterStatus::Updating))?
    }

    /// Leave `Updating`; `fatal` failures move the cluster to `Error`
    fn finish_update(&self, id: &ClusterId, error: Option<&Error>, fatal: bool) -> Result<()> {
        self.registry.update(id, |r| match error {
            Some(e) if fatal => r.cluster.fail(e),
            _ => {
                if let Err(e) = r.cluster.transition(ClusterStatus::Running) {
                    warn!(cluster = %id, error = %e, "Unexpected status after update");
                }
            }
        })
    }
}

async fn verify(backend: &dyn Backend) -> Result<()> {
    backend.verify_identity().await?;
    backend.validate_permissions().await
}

/// Fold a completed scale request into the stored spec
fn apply_request(spec: &mut ClusterSpec, request: &ScaleRequest) {
    if let Some(replicas) = request.control_plane {
        spec.control_plane.replicas = replicas;
    }
    for group in &mut spec.node_groups {
        if let Some(replicas) = request.node_groups.get(&group.name) {
            group.replicas = *replicas;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kubeforge_common::types::{ControlPlaneSpec, NodeGroupSpec, ResourceClass, Tags};

    use crate::backend::CommandOutput;
    use crate::testing::FakeBackend;

    fn spec(name: &str, workers: u32) -> ClusterSpec {
        ClusterSpec {
            name: name.to_string(),
            backend: "fake".to_string(),
            kubernetes_version: "1.30.2".to_string(),
            control_plane: ControlPlaneSpec {
                replicas: 1,
                machine_class: "t3.medium".to_string(),
                static_address: false,
                data_volume_gib: None,
            },
            node_groups: vec![NodeGroupSpec {
                name: "workers".to_string(),
                replicas: workers,
                machine_class: "t3.large".to_string(),
            }],
            ingress: None,
            cni: Default::default(),
            tags: Tags::new(),
        }
    }

    fn manager(backend: &Arc<FakeBackend>, state: &tempfile::TempDir) -> ClusterManager {
        ClusterManager::with_store(
            backend.clone(),
            OrchestratorConfig::default(),
            TrackerStore::new(state.path()),
        )
    }

    async fn running(manager: &ClusterManager, name: &str, workers: u32) -> ClusterId {
        let handle = manager.create(spec(name, workers)).unwrap();
        let id = handle.cluster_id().clone();
        let cluster = handle.wait().await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        id
    }

    #[tokio::test]
    async fn start_loads_configuration_and_checks_the_backend() {
        let backend = Arc::new(FakeBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            format!("networkCidr: 10.42.0.0/16\nstateDir: {}\n", state_dir.display()),
        )
        .unwrap();

        let manager = ClusterManager::start(
            backend.clone(),
            ManagerOptions {
                config_path: Some(path),
                telemetry: Some(TelemetryConfig::default()),
            },
        )
        .await
        .unwrap();

        assert_eq!(manager.config().network_cidr, "10.42.0.0/16");
        assert_eq!(manager.config().state_dir.as_deref(), Some(state_dir.as_path()));
        assert_eq!(backend.count("verify_identity:"), 1);
    }

    #[tokio::test]
    async fn start_rejects_an_invalid_configuration() {
        let backend = Arc::new(FakeBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "networkCidr: not-a-range\n").unwrap();

        let options = ManagerOptions {
            config_path: Some(path),
            telemetry: None,
        };
        assert!(ClusterManager::start(backend.clone(), options).await.is_err());
        assert_eq!(backend.count("verify_identity:"), 0);
    }

    // =========================================================================
    // Story Tests: Cluster Lifecycle
    // =========================================================================

    /// Story: create a cluster, use it, delete it, and nothing is left
    #[tokio::test(start_paused = true)]
    async fn story_create_then_delete_leaves_nothing_behind() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);

        let id = running(&manager, "dev", 2).await;
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.get(&id).unwrap().endpoint.as_deref(), Some("https://54.0.0.1:6443"));
        assert!(manager.kubeconfig(&id).is_ok());
        assert_eq!(manager.health(&id).await.unwrap().ready(), 3);
        assert_eq!(backend.count("verify_identity:"), 1);

        let report = manager.delete(&id).await.unwrap();
        assert!(report.is_clean(), "warnings: {:?}", report.warnings());
        assert!(manager.list().is_empty());
        assert_eq!(backend.running_nodes(), 0);
        assert!(!backend.exists("vpc-1"));
        assert!(TrackerStore::new(state.path()).load(&id).unwrap().is_none());
    }

    /// Story: a delete issued while the cluster is still being created waits
    /// for provisioning to finish and then removes everything it made
    #[tokio::test(start_paused = true)]
    async fn story_delete_right_after_create_waits_for_provisioning() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);

        let handle = manager.create(spec("dev", 1)).unwrap();
        let id = handle.cluster_id().clone();
        let report = manager.delete(&id).await.unwrap();

        let cluster = handle.wait().await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert!(report.is_clean(), "warnings: {:?}", report.warnings());
        assert!(!report.deleted.is_empty());
        assert!(manager.list().is_empty());
        assert_eq!(backend.running_nodes(), 0);
        assert!(!backend.exists("vpc-1"));
        assert_eq!(manager.registry().lock_count(), 0);
    }

    /// Story: a failed creation leaves an Error record that can be recreated
    #[tokio::test(start_paused = true)]
    async fn story_failed_create_can_be_retried() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        backend.fail_times(
            "create_security_boundary",
            "dev-nodes",
            1,
            Error::quota_exceeded("fake", "security group limit reached"),
        );

        let handle = manager.create(spec("dev", 1)).unwrap();
        let id = handle.cluster_id().clone();
        assert!(matches!(handle.wait().await.unwrap_err(), Error::QuotaExceeded { .. }));
        let failed = manager.get(&id).unwrap();
        assert_eq!(failed.status, ClusterStatus::Error);
        assert!(failed.message.unwrap().contains("security group limit"));
        assert!(!backend.exists("vpc-1"));

        let cluster = manager.create(spec("dev", 1)).unwrap().wait().await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
    }

    /// Story: shutdown interrupts a creation stuck waiting for bootstrap
    #[tokio::test(start_paused = true)]
    async fn story_shutdown_cancels_in_flight_creation() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        backend.respond(
            "test -f /var/lib/kubeforge/bootstrap-complete",
            CommandOutput::failed(1, ""),
        );

        let handle = manager.create(spec("dev", 1)).unwrap();
        let id = handle.cluster_id().clone();
        while !backend.ran_command_containing("bootstrap-complete") {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        manager.shutdown();

        assert!(handle.wait().await.unwrap_err().is_cancelled());
        assert_eq!(manager.get(&id).unwrap().status, ClusterStatus::Error);
        assert_eq!(backend.running_nodes(), 0);
        assert!(manager.create(spec("other", 0)).unwrap_err().is_cancelled());
    }

    /// Story: a cluster created by another process is deleted through discovery
    #[tokio::test(start_paused = true)]
    async fn story_delete_without_tracker_discovers_resources() {
        let backend = Arc::new(FakeBackend::new());
        let first_state = tempfile::tempdir().unwrap();
        let id = running(&manager(&backend, &first_state), "dev", 1).await;

        let fresh_state = tempfile::tempdir().unwrap();
        let fresh = manager(&backend, &fresh_state);
        let report = fresh.delete(&id).await.unwrap();

        assert!(report.was_deleted(ResourceClass::Network, "vpc-1"));
        assert_eq!(backend.running_nodes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_an_unknown_cluster_is_not_found() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let err = manager(&backend, &state)
            .delete(&ClusterId::new("fake", "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_create_is_rejected_and_backend_must_match() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        running(&manager, "dev", 0).await;

        assert!(manager.create(spec("dev", 0)).is_err());

        let mut other = spec("prod", 0);
        other.backend = "aws".to_string();
        assert!(matches!(
            manager.create(other).unwrap_err(),
            Error::Configuration { .. }
        ));
    }

    // =========================================================================
    // Story Tests: Day-2 Operations
    // =========================================================================

    /// Story: scaling workers up and back down
    #[tokio::test(start_paused = true)]
    async fn story_scale_workers_up_and_down() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        let id = running(&manager, "dev", 1).await;

        let request = ScaleRequest {
            node_groups: [("workers".to_string(), 3)].into(),
            ..Default::default()
        };
        let cluster = manager.update(&id, request).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert_eq!(cluster.metadata.get(metadata::WORKER_NODES).map(String::as_str), Some("3"));
        assert_eq!(backend.running_nodes(), 4);

        let record = manager.registry().get(&id).unwrap();
        assert_eq!(record.spec.node_groups[0].replicas, 3);
        let tracker = TrackerStore::new(state.path()).load(&id).unwrap().unwrap();
        assert_eq!(tracker.ids(ResourceClass::ComputeNode).len(), 4);

        let request = ScaleRequest {
            node_groups: [("workers".to_string(), 1)].into(),
            ..Default::default()
        };
        manager.update(&id, request).await.unwrap();
        assert_eq!(backend.running_nodes(), 2);
        assert!(backend.ran_command_containing("drain dev-workers-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scale_moves_cluster_to_error() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        let id = running(&manager, "dev", 1).await;
        backend.fail("create_node", Error::quota_exceeded("fake", "instance limit"));

        let request = ScaleRequest {
            node_groups: [("workers".to_string(), 2)].into(),
            ..Default::default()
        };
        assert!(manager.update(&id, request.clone()).await.is_err());
        assert_eq!(manager.get(&id).unwrap().status, ClusterStatus::Error);

        let err = manager.update(&id, request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    /// Story: back up a cluster and restore it
    #[tokio::test(start_paused = true)]
    async fn story_backup_and_restore() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        let id = running(&manager, "dev", 0).await;

        let backup = manager.backup(&id).await.unwrap();
        assert_eq!(manager.backups(&id).unwrap(), vec![backup.clone()]);
        assert_eq!(
            manager.get(&id).unwrap().metadata.get(LAST_BACKUP),
            Some(&backup.id.to_string())
        );

        let cluster = manager.restore(&id, backup.id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert!(backend.ran_command_containing("snapshot restore"));

        let err = manager.restore(&id, Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restore_moves_cluster_to_error() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        let id = running(&manager, "dev", 0).await;
        let backup = manager.backup(&id).await.unwrap();
        backend.respond("snapshot restore", CommandOutput::failed(1, "corrupt snapshot"));

        assert!(manager.restore(&id, backup.id).await.is_err());
        assert_eq!(manager.get(&id).unwrap().status, ClusterStatus::Error);
    }

    /// Story: install metrics-server, read metrics, then remove it
    #[tokio::test(start_paused = true)]
    async fn story_addon_install_metrics_uninstall() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        let id = running(&manager, "dev", 1).await;

        manager.install_addon(&id, Addon::MetricsServer).await.unwrap();
        let installed: Vec<Addon> = manager
            .list_addons(&id)
            .unwrap()
            .into_iter()
            .filter(|s| s.installed_version.is_some())
            .map(|s| s.addon)
            .collect();
        assert_eq!(installed, [Addon::MetricsServer]);

        let metrics = manager.metrics(&id).await.unwrap();
        assert_eq!(metrics.total_nodes, 2);
        assert_eq!(metrics.cpu_millicores(), 500);

        manager.uninstall_addon(&id, Addon::MetricsServer).await.unwrap();
        assert!(backend.ran_command_containing("delete --ignore-not-found -f"));
        assert!(manager
            .uninstall_addon(&id, Addon::MetricsServer)
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(manager.get(&id).unwrap().status, ClusterStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_addon_install_keeps_cluster_running() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);
        let id = running(&manager, "dev", 0).await;
        backend.respond("apply -f https://github.com/cert-manager", CommandOutput::failed(1, "boom"));

        assert!(manager.install_addon(&id, Addon::CertManager).await.is_err());
        let cluster = manager.get(&id).unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert!(!addons::is_installed(&cluster, Addon::CertManager));
    }

    #[tokio::test(start_paused = true)]
    async fn independent_clusters_provision_concurrently() {
        let backend = Arc::new(FakeBackend::new());
        let state = tempfile::tempdir().unwrap();
        let manager = manager(&backend, &state);

        let a = manager.create(spec("alpha", 1)).unwrap();
        let b = manager.create(spec("beta", 1)).unwrap();
        let (a, b) = tokio::join!(a.wait(), b.wait());

        assert_eq!(a.unwrap().status, ClusterStatus::Running);
        assert_eq!(b.unwrap().status, ClusterStatus::Running);
        assert_eq!(manager.list().len(), 2);
    }
}
