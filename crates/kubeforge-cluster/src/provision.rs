//! Provisioning pipeline
//!
//! Turns a [`ClusterSpec`] into a running cluster:
//!
//! 1. network
//! 2. security boundary
//! 3. control-plane nodes (and the optional static API address)
//! 4. primary node readiness and control-plane initialization
//! 5. join credentials
//! 6. additional control-plane joins
//! 7. worker nodes
//! 8. networking layer
//! 9. health verification
//! 10. ingress metadata
//!
//! Every created id is recorded in the [`ResourceTracker`] before the next
//! step starts. A failure in steps 1-8 rolls back whatever the tracker holds;
//! step 9 failures are reported on the result, step 10 failures are logged.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use kubeforge_common::config::OrchestratorConfig;
use kubeforge_common::kubeconfig::Kubeconfig;
use kubeforge_common::retry::poll_until;
use kubeforge_common::types::{
    Cluster, ClusterInfrastructure, ClusterSpec, ClusterStatus, NodeGroupSpec, NodeInfo,
    NodeRole, ResourceClass,
};
use kubeforge_common::{Error, Result, API_SERVER_PORT};

use crate::backend::{
    AddressRequest, Backend, LoadBalancerRequest, NetworkRequest, NetworkState, NodeRequest,
    SecurityBoundaryRequest, SecurityRule, VolumeRequest,
};
use crate::bootstrap::{
    commands, BootstrapPayload, BootstrapRole, NodeBootstrap, NodeBootstrapper, RemoteShell,
};
use crate::health::{HealthChecker, HealthReport};
use crate::teardown::{TeardownOrchestrator, TeardownReport};
use crate::tracker::{ResourceTracker, TrackerStore};

/// Metadata keys written on the cluster record
pub mod metadata {
    /// Network container id
    pub const NETWORK_ID: &str = "networkId";
    /// Security boundary id
    pub const SECURITY_BOUNDARY_ID: &str = "securityBoundaryId";
    /// Control-plane node count
    pub const CONTROL_PLANE_NODES: &str = "controlPlaneNodes";
    /// Worker node count
    pub const WORKER_NODES: &str = "workerNodes";
    /// Networking layer
    pub const CNI: &str = "cni";
    /// Static API address
    pub const API_ADDRESS: &str = "apiAddress";
    /// Ingress base domain
    pub const INGRESS_DOMAIN: &str = "ingressDomain";
    /// Ingress load balancer DNS name
    pub const INGRESS_LOAD_BALANCER: &str = "ingressLoadBalancer";
    /// Last health verification failure
    pub const HEALTH_ERROR: &str = "healthError";
}

/// Ports the ingress load balancer forwards
const INGRESS_PORTS: [u16; 2] = [80, 443];

/// A successfully provisioned cluster
#[derive(Debug)]
pub struct Provisioned {
    /// Cluster record, `Running`
    pub cluster: Cluster,
    /// Topology as created
    pub infrastructure: ClusterInfrastructure,
    /// Everything created
    pub tracker: ResourceTracker,
    /// Client access descriptor
    pub kubeconfig: Kubeconfig,
    /// Final readiness snapshot, when verification passed
    pub health: Option<HealthReport>,
    /// Why health verification failed; the infrastructure is kept
    pub health_error: Option<Error>,
}

/// A failed provisioning attempt, after rollback
#[derive(Debug)]
pub struct ProvisionFailure {
    /// Cluster record, `Error`
    pub cluster: Cluster,
    /// The step failure
    pub error: Error,
    /// What had been created when the step failed
    pub tracker: ResourceTracker,
    /// Outcome of the rollback
    pub teardown: TeardownReport,
}

/// Output of steps 1-8
struct Built {
    infrastructure: ClusterInfrastructure,
    /// Primary node, still holding its remote credential
    primary: NodeInfo,
    endpoint_host: String,
}

/// Runs the provisioning steps against a backend
pub struct ProvisioningPipeline<'a> {
    backend: &'a dyn Backend,
    config: &'a OrchestratorConfig,
    cancel: &'a CancellationToken,
    store: Option<&'a TrackerStore>,
}

impl<'a> ProvisioningPipeline<'a> {
    /// Pipeline over a backend
    pub fn new(
        backend: &'a dyn Backend,
        config: &'a OrchestratorConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            backend,
            config,
            cancel,
            store: None,
        }
    }

    /// Persist the tracker after every recorded resource
    pub fn with_store(mut self, store: &'a TrackerStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Provision a cluster, rolling back on failure
    #[instrument(skip_all, fields(cluster = %spec.id()))]
    pub async fn provision(
        &self,
        spec: &ClusterSpec,
    ) -> std::result::Result<Provisioned, ProvisionFailure> {
        let region = self.backend.region();
        let mut cluster = Cluster::new(spec, &region);
        let mut tracker = ResourceTracker::new(&spec.name, &region);

        if let Err(e) = spec.validate() {
            cluster.fail(&e);
            return Err(ProvisionFailure {
                cluster,
                error: e,
                tracker,
                teardown: TeardownReport::default(),
            });
        }

        info!(
            cluster = %cluster.id,
            nodes = spec.total_nodes(),
            "Provisioning cluster"
        );

        let built = match self.build(spec, &mut cluster, &mut tracker).await {
            Ok(built) => built,
            Err(e) => return Err(self.rollback(cluster, tracker, e).await),
        };

        let endpoint = format!("https://{}:{}", built.endpoint_host, API_SERVER_PORT);
        cluster.endpoint = Some(endpoint.clone());

        // Step 9
        let expected = built.infrastructure.node_count();
        let (health, health_error) = match HealthChecker::new(self.backend, self.config, self.cancel)
            .wait_healthy(&built.primary, expected)
            .await
        {
            Ok(report) => (Some(report), None),
            Err(e) => {
                warn!(cluster = %cluster.id, error = %e, "Health verification failed, keeping infrastructure");
                cluster.set_metadata(metadata::HEALTH_ERROR, e.to_string());
                (None, Some(e))
            }
        };

        if let Err(e) = cluster.transition(ClusterStatus::Running) {
            return Err(self.rollback(cluster, tracker, e).await);
        }

        // Step 10
        self.configure_ingress(spec, &mut cluster, &mut tracker, &built.infrastructure)
            .await;

        let kubeconfig = self.kubeconfig(spec, &built.primary, &endpoint).await;
        self.persist(&cluster, &tracker);

        info!(cluster = %cluster.id, endpoint = %endpoint, "Cluster provisioned");
        Ok(Provisioned {
            cluster,
            infrastructure: built.infrastructure,
            tracker,
            kubeconfig,
            health,
            health_error,
        })
    }

    /// Steps 1-8
    async fn build(
        &self,
        spec: &ClusterSpec,
        cluster: &mut Cluster,
        tracker: &mut ResourceTracker,
    ) -> Result<Built> {
        let bootstrapper = NodeBootstrapper::new(self.backend, self.config, self.cancel);

        // 1. Network
        self.check_cancelled("network creation")?;
        let network = self
            .backend
            .create_network(&NetworkRequest {
                name: format!("{}-network", spec.name),
                cidr: self.config.network_cidr.clone(),
                tags: spec.cluster_tags(),
            })
            .await?;
        self.record(cluster, tracker, ResourceClass::Network, &network.network_id)?;
        for resource in &network.resources {
            self.record(cluster, tracker, resource.class, &resource.id)?;
        }
        self.wait_network_available(&network.network_id).await?;
        cluster.set_metadata(metadata::NETWORK_ID, &network.network_id);
        info!(network = %network.network_id, "Network available");

        // 2. Security boundary
        self.check_cancelled("security boundary creation")?;
        let boundary = self
            .backend
            .create_security_boundary(&SecurityBoundaryRequest {
                name: format!("{}-nodes", spec.name),
                network_id: network.network_id.clone(),
                description: format!("kubeforge cluster {} nodes", spec.name),
                tags: spec.cluster_tags(),
            })
            .await?;
        self.record(cluster, tracker, ResourceClass::SecurityBoundary, &boundary)?;
        self.backend
            .authorize_rules(&boundary, &cluster_rules())
            .await?;
        cluster.set_metadata(metadata::SECURITY_BOUNDARY_ID, &boundary);
        info!(security_boundary = %boundary, "Security boundary ready");

        // 3. Control-plane nodes
        let placement = NodePlacement {
            network_id: network.network_id.clone(),
            security_boundary_id: boundary.clone(),
        };
        let mut control_plane = Vec::new();
        for i in 0..spec.control_plane.replicas {
            let slot = NodeSlot::control_plane(spec, i);
            let node = self
                .create_node(spec, cluster, tracker, slot, &placement)
                .await?;
            let role = if i == 0 {
                BootstrapRole::Primary
            } else {
                BootstrapRole::JoinControlPlane
            };
            control_plane.push(NodeBootstrap::new(node, role));
        }
        let static_address = if spec.control_plane.static_address {
            self.check_cancelled("address allocation")?;
            let address = self
                .backend
                .allocate_address(&AddressRequest {
                    name: format!("{}-api", spec.name),
                    tags: spec.cluster_tags(),
                })
                .await?;
            self.record(cluster, tracker, ResourceClass::Address, &address.id)?;
            cluster.set_metadata(metadata::API_ADDRESS, &address.public_ip);
            Some(address)
        } else {
            None
        };

        // 4. Primary
        let (primary, additional) = control_plane
            .split_first_mut()
            .ok_or_else(|| Error::validation_for(&spec.name, "no control-plane nodes"))?;
        bootstrapper.wait_infrastructure_ready(primary).await?;
        if let Some(ref address) = static_address {
            self.backend
                .associate_address(&address.id, &primary.node.id)
                .await?;
            primary.node.public_address = Some(address.public_ip.clone());
        }
        bootstrapper.wait_bootstrap_complete(primary).await?;

        let endpoint_host = match static_address {
            Some(ref address) => address.public_ip.clone(),
            None => primary
                .node
                .address()
                .map(str::to_string)
                .ok_or_else(|| Error::internal_with_context("provision", "primary has no address"))?,
        };
        let multi_primary = !additional.is_empty();

        // 5. Join credentials come back from initialization
        let credentials = bootstrapper
            .initialize_primary(
                primary,
                &endpoint_host,
                spec.version(),
                spec.cni,
                multi_primary,
            )
            .await?;

        // 6. Additional control-plane nodes
        if additional.is_empty() {
            debug!("Single control-plane node, skipping control-plane joins");
        }
        for boot in additional.iter_mut() {
            bootstrapper.wait_ready(boot).await?;
            bootstrapper.join(boot, &credentials).await?;
        }

        // 7. Workers
        let mut workers = Vec::new();
        for group in &spec.node_groups {
            if group.replicas == 0 {
                debug!(node_group = %group.name, "Skipping empty node group");
                continue;
            }
            for i in 0..group.replicas {
                let slot = NodeSlot::worker(spec, group, i);
                let node = self
                    .create_node(spec, cluster, tracker, slot, &placement)
                    .await?;
                workers.push(NodeBootstrap::new(node, BootstrapRole::Worker));
            }
        }
        for boot in workers.iter_mut() {
            bootstrapper.wait_ready(boot).await?;
            bootstrapper.join(boot, &credentials).await?;
        }

        // 8. Networking layer
        let primary_node = control_plane[0].node.clone();
        bootstrapper.install_cni(&primary_node, spec.cni).await?;
        cluster.set_metadata(metadata::CNI, spec.cni.to_string());
        cluster.set_metadata(metadata::CONTROL_PLANE_NODES, control_plane.len().to_string());
        cluster.set_metadata(metadata::WORKER_NODES, workers.len().to_string());

        Ok(Built {
            infrastructure: ClusterInfrastructure {
                network_id: Some(network.network_id),
                security_boundary_ids: vec![boundary],
                control_plane: control_plane.into_iter().map(NodeBootstrap::into_node).collect(),
                workers: workers.into_iter().map(NodeBootstrap::into_node).collect(),
                join: Some(credentials),
            },
            primary: primary_node,
            endpoint_host,
        })
    }

    async fn create_node(
        &self,
        spec: &ClusterSpec,
        cluster: &Cluster,
        tracker: &mut ResourceTracker,
        slot: NodeSlot,
        placement: &NodePlacement,
    ) -> Result<NodeInfo> {
        self.check_cancelled("node creation")?;
        let request = node_request(spec, slot, placement)?;
        let node = self.backend.create_node(&request).await?;
        self.record(cluster, tracker, ResourceClass::ComputeNode, &node.id)?;
        info!(node = %node.name, id = %node.id, role = %request.role, "Created node");

        if request.role == NodeRole::ControlPlane {
            if let Some(volume) = data_volume_request(spec, &node) {
                let created = self.backend.create_volume(&volume).await?;
                self.record(cluster, tracker, ResourceClass::Volume, &created.id)?;
                debug!(node = %node.name, volume = %created.id, size_gib = created.size_gib, "Attached data volume");
            }
        }
        Ok(node)
    }

    async fn wait_network_available(&self, network_id: &str) -> Result<()> {
        poll_until(
            &self.config.network_available,
            &format!("network {} availability", network_id),
            self.cancel,
            || async {
                match self.backend.describe_network(network_id).await? {
                    Some(NetworkState::Available) => Ok(Some(())),
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    /// Best-effort ingress setup
    async fn configure_ingress(
        &self,
        spec: &ClusterSpec,
        cluster: &mut Cluster,
        tracker: &mut ResourceTracker,
        infrastructure: &ClusterInfrastructure,
    ) {
        let Some(ref ingress) = spec.ingress else {
            return;
        };
        cluster.set_metadata(metadata::INGRESS_DOMAIN, &ingress.domain);
        if !ingress.load_balancer {
            return;
        }

        let targets: Vec<String> = if infrastructure.workers.is_empty() {
            infrastructure.control_plane.iter().map(|n| n.id.clone()).collect()
        } else {
            infrastructure.workers.iter().map(|n| n.id.clone()).collect()
        };
        let request = LoadBalancerRequest {
            name: format!("{}-ingress", spec.name),
            network_id: infrastructure.network_id.clone().unwrap_or_default(),
            target_node_ids: targets,
            ports: INGRESS_PORTS.to_vec(),
            tags: spec.cluster_tags(),
        };
        match self.backend.create_load_balancer(&request).await {
            Ok(lb) => {
                if let Err(e) = self.record(cluster, tracker, ResourceClass::LoadBalancer, &lb.id) {
                    warn!(error = %e, "Failed to record ingress load balancer");
                }
                cluster.set_metadata(metadata::INGRESS_LOAD_BALANCER, &lb.dns_name);
                info!(dns_name = %lb.dns_name, "Ingress load balancer created");
            }
            Err(e) => warn!(cluster = %cluster.id, error = %e, "Failed to create ingress load balancer"),
        }
    }

    /// Kubeconfig from the primary's admin.conf, or placeholder credentials
    async fn kubeconfig(&self, spec: &ClusterSpec, primary: &NodeInfo, endpoint: &str) -> Kubeconfig {
        let fetched = async {
            let output = RemoteShell::new(self.backend)
                .run_labeled(primary, &commands::read_admin_conf(), "read admin.conf")
                .await?;
            Kubeconfig::from_admin_conf(&output.stdout, &spec.name, endpoint)
        }
        .await;

        match fetched {
            Ok(config) => config,
            Err(e) => {
                warn!(cluster = %spec.name, error = %e, "Could not fetch admin credentials, kubeconfig needs manual authentication");
                Kubeconfig::for_cluster(&spec.name, endpoint)
            }
        }
    }

    /// Tear down everything recorded and report the original failure
    ///
    /// Runs under a fresh cancellation token so a cancelled create still
    /// cleans up after itself.
    async fn rollback(
        &self,
        mut cluster: Cluster,
        mut tracker: ResourceTracker,
        error: Error,
    ) -> ProvisionFailure {
        for resource in error.partially_created() {
            if let Err(e) = tracker.record_ref(resource) {
                warn!(error = %e, "Failed to record partially created resource");
            }
        }
        cluster.fail(&error);
        error!(
            cluster = %cluster.id,
            error = %error,
            resources = tracker.len(),
            "Provisioning failed, rolling back"
        );

        let cleanup = CancellationToken::new();
        let teardown = TeardownOrchestrator::new(self.backend, self.config, &cleanup)
            .teardown(&tracker)
            .await;
        if teardown.is_clean() {
            if let Some(store) = self.store {
                if let Err(e) = store.remove(&cluster.id) {
                    warn!(error = %e, "Failed to remove tracker after rollback");
                }
            }
        } else {
            warn!(
                cluster = %cluster.id,
                errors = teardown.errors.len(),
                "Rollback left resources behind"
            );
            self.persist(&cluster, &tracker);
        }

        ProvisionFailure {
            cluster,
            error,
            tracker,
            teardown,
        }
    }

    fn record(
        &self,
        cluster: &Cluster,
        tracker: &mut ResourceTracker,
        class: ResourceClass,
        id: &str,
    ) -> Result<()> {
        if tracker.record(class, id)? {
            self.persist(cluster, tracker);
        }
        Ok(())
    }

    fn persist(&self, cluster: &Cluster, tracker: &ResourceTracker) {
        if let Some(store) = self.store {
            if let Err(e) = store.save(&cluster.id, tracker) {
                warn!(cluster = %cluster.id, error = %e, "Failed to persist resource tracker");
            }
        }
    }

    fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        Ok(())
    }
}

/// Where new nodes are placed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePlacement {
    /// Network container
    pub network_id: String,
    /// Security boundary attached to every node
    pub security_boundary_id: String,
}

/// Name, role and machine class of a node about to be created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSlot {
    /// Node name
    pub name: String,
    /// Role
    pub role: NodeRole,
    /// Node-group of a worker
    pub node_group: Option<String>,
    /// Backend machine class
    pub machine_class: String,
}

impl NodeSlot {
    /// Control-plane node `<cluster>-cp-<index>`
    pub fn control_plane(spec: &ClusterSpec, index: u32) -> Self {
        Self {
            name: format!("{}-cp-{}", spec.name, index),
            role: NodeRole::ControlPlane,
            node_group: None,
            machine_class: spec.control_plane.machine_class.clone(),
        }
    }

    /// Worker `<cluster>-<group>-<index>`
    pub fn worker(spec: &ClusterSpec, group: &NodeGroupSpec, index: u32) -> Self {
        Self {
            name: format!("{}-{}-{}", spec.name, group.name, index),
            role: NodeRole::Worker,
            node_group: Some(group.name.clone()),
            machine_class: group.machine_class.clone(),
        }
    }
}

/// Backend request for a node, carrying its tags and bootstrap payload
pub fn node_request(
    spec: &ClusterSpec,
    slot: NodeSlot,
    placement: &NodePlacement,
) -> Result<NodeRequest> {
    let payload = BootstrapPayload::new(&slot.name, slot.role, spec.version())?;
    Ok(NodeRequest {
        tags: spec.node_tags(slot.role, slot.node_group.as_deref()),
        name: slot.name,
        role: slot.role,
        node_group: slot.node_group,
        machine_class: slot.machine_class,
        network_id: placement.network_id.clone(),
        security_boundary_ids: vec![placement.security_boundary_id.clone()],
        bootstrap_payload: payload.encoded(),
    })
}

/// Dedicated etcd volume `<node>-etcd` for a control-plane node, if configured
pub fn data_volume_request(spec: &ClusterSpec, node: &NodeInfo) -> Option<VolumeRequest> {
    spec.control_plane.data_volume_gib.map(|size_gib| VolumeRequest {
        name: format!("{}-etcd", node.name),
        size_gib,
        attach_to: Some(node.id.clone()),
        tags: spec.cluster_tags(),
    })
}

/// API server, SSH, traffic between nodes, and all egress
pub fn cluster_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule::tcp_ingress(API_SERVER_PORT, API_SERVER_PORT, "0.0.0.0/0"),
        SecurityRule::tcp_ingress(22, 22, "0.0.0.0/0"),
        SecurityRule::intra_cluster(),
        SecurityRule::egress_all(),
    ]
}
