//! Cluster model shared by every kubeforge crate
//!
//! [`ClusterSpec`] is the immutable user input, [`Cluster`] the mutable record
//! of what provisioning produced, and [`ClusterInfrastructure`] the cached view
//! of a cluster's topology. Resource bookkeeping types ([`ResourceClass`],
//! [`ResourceRef`]) live here too so errors can name what failed.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result, CLUSTER_TAG, MANAGED_BY_TAG, MANAGED_BY_VALUE, NODE_GROUP_TAG, ROLE_TAG,
};

/// Free-form key/value tags attached to backend resources
pub type Tags = BTreeMap<String, String>;

// =============================================================================
// Resource bookkeeping
// =============================================================================

/// Category of backend resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    /// Network container (VPC or equivalent)
    Network,
    /// Subdivision of a network
    Subnet,
    /// Routing table attached to a network
    RouteTable,
    /// Internet/egress gateway attached to a network
    InternetGateway,
    /// NAT/outbound gateway
    NatGateway,
    /// Security group or firewall
    SecurityBoundary,
    /// Compute instance
    ComputeNode,
    /// Allocated public address
    Address,
    /// Network interface
    NetworkInterface,
    /// Block storage volume
    Volume,
    /// Load balancer
    LoadBalancer,
}

impl ResourceClass {
    /// Every resource class, in declaration order
    pub const ALL: [ResourceClass; 11] = [
        ResourceClass::Network,
        ResourceClass::Subnet,
        ResourceClass::RouteTable,
        ResourceClass::InternetGateway,
        ResourceClass::NatGateway,
        ResourceClass::SecurityBoundary,
        ResourceClass::ComputeNode,
        ResourceClass::Address,
        ResourceClass::NetworkInterface,
        ResourceClass::Volume,
        ResourceClass::LoadBalancer,
    ];

    /// Stable kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::RouteTable => "route-table",
            Self::InternetGateway => "internet-gateway",
            Self::NatGateway => "nat-gateway",
            Self::SecurityBoundary => "security-boundary",
            Self::ComputeNode => "compute-node",
            Self::Address => "address",
            Self::NetworkInterface => "network-interface",
            Self::Volume => "volume",
            Self::LoadBalancer => "load-balancer",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend resource identified by class and id
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource class
    pub class: ResourceClass,
    /// Backend-assigned id
    pub id: String,
}

impl ResourceRef {
    /// Create a new resource reference
    pub fn new(class: ResourceClass, id: impl Into<String>) -> Self {
        Self {
            class,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.id)
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Structured cluster identifier: one cluster name per backend
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId {
    /// Backend the cluster lives on
    pub backend: String,
    /// Cluster name, unique per backend
    pub name: String,
}

impl ClusterId {
    /// Create an id from backend and cluster name
    pub fn new(backend: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.name)
    }
}

impl FromStr for ClusterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((backend, name)) if !backend.is_empty() && !name.is_empty() => {
                Ok(Self::new(backend, name))
            }
            _ => Err(Error::validation(format!(
                "cluster id must look like <backend>:<name>, got '{}'",
                s
            ))),
        }
    }
}

// =============================================================================
// Cluster specification
// =============================================================================

/// Role of a compute node in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs the Kubernetes control plane
    ControlPlane,
    /// Runs workloads
    Worker,
}

impl NodeRole {
    /// Tag value for this role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control-plane" | "master" => Ok(Self::ControlPlane),
            "worker" => Ok(Self::Worker),
            other => Err(Error::validation(format!("unknown node role '{}'", other))),
        }
    }
}

/// Cluster networking layer installed after control-plane initialization
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cni {
    /// Calico
    #[default]
    Calico,
    /// Flannel
    Flannel,
}

impl Cni {
    /// Pod network CIDR passed to control-plane initialization
    pub fn pod_cidr(&self) -> &'static str {
        match self {
            Self::Calico => "192.168.0.0/16",
            Self::Flannel => "10.244.0.0/16",
        }
    }

    /// Manifest applied on the primary node
    pub fn manifest_url(&self) -> &'static str {
        match self {
            Self::Calico => {
                "https://raw.githubusercontent.com/projectcalico/calico/v3.28.1/manifests/calico.yaml"
            }
            Self::Flannel => {
                "https://github.com/flannel-io/flannel/releases/download/v0.25.6/kube-flannel.yml"
            }
        }
    }
}

impl fmt::Display for Cni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calico => write!(f, "calico"),
            Self::Flannel => write!(f, "flannel"),
        }
    }
}

/// Control-plane topology
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Number of control-plane nodes
    pub replicas: u32,
    /// Backend machine class (instance type)
    pub machine_class: String,
    /// Allocate a static public address for the API endpoint
    #[serde(default)]
    pub static_address: bool,
    /// Size of a dedicated etcd volume attached to each control-plane node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_gib: Option<u32>,
}

/// A named group of identical worker nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Group name, a DNS label
    pub name: String,
    /// Number of workers in the group
    pub replicas: u32,
    /// Backend machine class (instance type)
    pub machine_class: String,
}

/// Domain and ingress configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Base domain served by the cluster's ingress
    pub domain: String,
    /// Provision a backend load balancer in front of the workers
    #[serde(default)]
    pub load_balancer: bool,
}

/// Immutable cluster specification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name, unique per backend
    pub name: String,
    /// Target backend identifier
    pub backend: String,
    /// Desired Kubernetes version (e.g. "1.30.2")
    pub kubernetes_version: String,
    /// Control-plane topology
    pub control_plane: ControlPlaneSpec,
    /// Worker node-groups
    #[serde(default)]
    pub node_groups: Vec<NodeGroupSpec>,
    /// Optional domain/ingress configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
    /// Networking layer
    #[serde(default)]
    pub cni: Cni,
    /// Free-form tags applied to every resource
    #[serde(default)]
    pub tags: Tags,
}

impl ClusterSpec {
    /// Validate the specification before any backend call is made
    pub fn validate(&self) -> Result<()> {
        validate_dns_label(&self.name)
            .map_err(|msg| Error::configuration_field(&self.name, "name", msg))?;

        if self.backend.is_empty() || self.backend.contains(':') {
            return Err(Error::configuration_field(
                &self.name,
                "backend",
                "backend must be non-empty and must not contain ':'",
            ));
        }

        parse_version(&self.kubernetes_version).ok_or_else(|| {
            Error::configuration_field(
                &self.name,
                "kubernetesVersion",
                format!(
                    "expected [v]MAJOR.MINOR.PATCH, got '{}'",
                    self.kubernetes_version
                ),
            )
        })?;

        if self.control_plane.replicas == 0 {
            return Err(Error::validation_for(
                &self.name,
                "control plane replicas must be at least 1",
            ));
        }
        if self.control_plane.data_volume_gib == Some(0) {
            return Err(Error::configuration_field(
                &self.name,
                "controlPlane.dataVolumeGib",
                "data volume must be at least 1 GiB",
            ));
        }
        if self.control_plane.machine_class.is_empty() {
            return Err(Error::configuration_field(
                &self.name,
                "controlPlane.machineClass",
                "machine class cannot be empty",
            ));
        }

        let mut seen = HashSet::new();
        for (i, group) in self.node_groups.iter().enumerate() {
            validate_dns_label(&group.name).map_err(|msg| {
                Error::configuration_field(&self.name, format!("nodeGroups[{}].name", i), msg)
            })?;
            if !seen.insert(group.name.as_str()) {
                return Err(Error::configuration_field(
                    &self.name,
                    format!("nodeGroups[{}].name", i),
                    format!("duplicate node group '{}'", group.name),
                ));
            }
            if group.machine_class.is_empty() {
                return Err(Error::configuration_field(
                    &self.name,
                    format!("nodeGroups[{}].machineClass", i),
                    "machine class cannot be empty",
                ));
            }
        }

        if let Some(ref ingress) = self.ingress {
            if ingress.domain.is_empty() {
                return Err(Error::configuration_field(
                    &self.name,
                    "ingress.domain",
                    "domain cannot be empty",
                ));
            }
        }

        Ok(())
    }

    /// Cluster id derived from backend and name
    pub fn id(&self) -> ClusterId {
        ClusterId::new(&self.backend, &self.name)
    }

    /// Kubernetes version without a leading `v`
    pub fn version(&self) -> &str {
        self.kubernetes_version
            .strip_prefix('v')
            .unwrap_or(&self.kubernetes_version)
    }

    /// Total number of worker replicas across node-groups
    pub fn worker_count(&self) -> u32 {
        self.node_groups.iter().map(|g| g.replicas).sum()
    }

    /// Total number of nodes the spec asks for
    pub fn total_nodes(&self) -> u32 {
        self.control_plane.replicas + self.worker_count()
    }

    /// Tags every resource of this cluster carries
    pub fn cluster_tags(&self) -> Tags {
        let mut tags = self.tags.clone();
        tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());
        tags.insert(CLUSTER_TAG.to_string(), self.name.clone());
        tags
    }

    /// Tags for a compute node, adding role and node-group
    pub fn node_tags(&self, role: NodeRole, node_group: Option<&str>) -> Tags {
        let mut tags = self.cluster_tags();
        tags.insert(ROLE_TAG.to_string(), role.as_str().to_string());
        if let Some(group) = node_group {
            tags.insert(NODE_GROUP_TAG.to_string(), group.to_string());
        }
        tags
    }
}

/// Validate a DNS-1123 label (lowercase alphanumeric with hyphens, max 63 chars).
pub fn validate_dns_label(s: &str) -> std::result::Result<(), String> {
    if s.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if s.len() > 63 {
        return Err(format!("name must be at most 63 characters: {}", s));
    }

    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return Err(format!("name must start with lowercase letter: {}", s)),
    }
    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return Err(format!(
            "name must be lowercase alphanumeric with hyphens: {}",
            s
        ));
    }
    if s.ends_with('-') {
        return Err(format!("name cannot end with hyphen: {}", s));
    }
    Ok(())
}

/// Parse `[v]MAJOR.MINOR.PATCH` into its numeric parts
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let v = version.strip_prefix('v').unwrap_or(version);
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

// =============================================================================
// Cluster record
// =============================================================================

/// Cluster lifecycle status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Provisioning pipeline is running
    #[default]
    Creating,
    /// Cluster is up
    Running,
    /// A scale, restore or addon operation is in progress
    Updating,
    /// Unrecoverable failure; only a fresh create leaves this state
    Error,
}

impl ClusterStatus {
    /// Whether `self -> next` is a legal lifecycle transition
    pub fn can_transition_to(&self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Error)
                | (Running, Updating)
                | (Updating, Running)
                | (Running, Error)
                | (Updating, Error)
                | (Error, Creating)
        )
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Updating => write!(f, "Updating"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Mutable record of a cluster's provisioning outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Structured id (backend + name)
    pub id: ClusterId,
    /// Cluster name
    pub name: String,
    /// Backend identifier
    pub backend: String,
    /// Backend region or location
    pub region: String,
    /// Kubernetes version
    pub kubernetes_version: String,
    /// Lifecycle status
    pub status: ClusterStatus,
    /// Externally reachable API endpoint (`https://<address>:6443`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Message describing the last failure, when in `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata (network id, node counts, ingress domain, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Cluster {
    /// Start a new cluster record in `Creating`
    pub fn new(spec: &ClusterSpec, region: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id(),
            name: spec.name.clone(),
            backend: spec.backend.clone(),
            region: region.into(),
            kubernetes_version: spec.kubernetes_version.clone(),
            status: ClusterStatus::Creating,
            endpoint: None,
            message: None,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: ClusterStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::internal_with_context(
                "cluster-status",
                format!(
                    "illegal transition {} -> {} for {}",
                    self.status, next, self.id
                ),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next != ClusterStatus::Error {
            self.message = None;
        }
        Ok(())
    }

    /// Move to `Error` recording the cause
    ///
    /// A cluster already in `Error` keeps its status and gets the new message.
    pub fn fail(&mut self, error: &Error) {
        if self.status != ClusterStatus::Error {
            // Every non-terminal state may move to Error.
            self.status = ClusterStatus::Error;
        }
        self.message = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Set a metadata entry
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Nodes and topology
// =============================================================================

/// Short-lived credential used to run commands on a node
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCredential {
    /// Login user
    pub username: String,
    /// Private key material (PEM)
    pub private_key: String,
    /// When the backend stops honoring this credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NodeCredential {
    /// Whether the credential is past its expiry
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}

impl fmt::Debug for NodeCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't expose key material in debug output
        f.debug_struct("NodeCredential")
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One compute node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Stable backend id
    pub id: String,
    /// Node (and Kubernetes node) name
    pub name: String,
    /// Private address, once assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
    /// Public address, once assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Backend machine class
    pub machine_class: String,
    /// Node role
    pub role: NodeRole,
    /// Node-group of a worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_group: Option<String>,
    /// Credential for remote execution, only carried during bootstrap
    #[serde(skip)]
    pub credential: Option<NodeCredential>,
}

impl NodeInfo {
    /// Address to reach the node at, preferring the public one
    pub fn address(&self) -> Option<&str> {
        self.public_address
            .as_deref()
            .or(self.private_address.as_deref())
    }

    /// Copy of this node with its credential dropped
    pub fn without_credential(&self) -> Self {
        Self {
            credential: None,
            ..self.clone()
        }
    }
}

/// Credentials for joining a node to an initialized control plane
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCredentials {
    /// `host:port` of the API server to join
    pub endpoint: String,
    /// Bootstrap token (`abcdef.0123456789abcdef`)
    pub token: String,
    /// `sha256:<hex>` hash of the cluster CA
    pub ca_cert_hash: String,
    /// Key decrypting uploaded control-plane certificates (multi-primary only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
}

impl fmt::Debug for JoinCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't expose the token or certificate key in debug output
        f.debug_struct("JoinCredentials")
            .field("endpoint", &self.endpoint)
            .field("ca_cert_hash", &self.ca_cert_hash)
            .field("has_certificate_key", &self.certificate_key.is_some())
            .finish()
    }
}

/// Live view of a cluster's topology
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfrastructure {
    /// Network container id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// Security boundary ids
    #[serde(default)]
    pub security_boundary_ids: Vec<String>,
    /// Control-plane nodes; the first is the primary
    #[serde(default)]
    pub control_plane: Vec<NodeInfo>,
    /// Worker nodes
    #[serde(default)]
    pub workers: Vec<NodeInfo>,
    /// Join credentials from the primary node
    #[serde(default, skip)]
    pub join: Option<JoinCredentials>,
}

impl ClusterInfrastructure {
    /// The control-plane node that initialized the cluster
    pub fn primary(&self) -> Option<&NodeInfo> {
        self.control_plane.first()
    }

    /// Workers belonging to a node-group
    pub fn workers_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a NodeInfo> {
        self.workers
            .iter()
            .filter(move |n| n.node_group.as_deref() == Some(group))
    }

    /// Total node count
    pub fn node_count(&self) -> usize {
        self.control_plane.len() + self.workers.len()
    }
}
