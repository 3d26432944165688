//! Backend capability interface
//!
//! Every infrastructure provider (public cloud or SSH-reachable machine set)
//! implements [`Backend`]. The orchestration core only ever talks to this
//! trait; it never sees a concrete cloud client.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use kubeforge_common::types::{NodeCredential, NodeInfo, NodeRole, ResourceRef, Tags};
use kubeforge_common::Result;

// =============================================================================
// Requests
// =============================================================================

/// Create a network container and its subdivisions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRequest {
    /// Resource name (`<cluster>-network`)
    pub name: String,
    /// Address range
    pub cidr: String,
    /// Tags applied to the network and everything created with it
    pub tags: Tags,
}

/// Create a security boundary inside a network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityBoundaryRequest {
    /// Resource name (`<cluster>-nodes`)
    pub name: String,
    /// Owning network
    pub network_id: String,
    /// Human-readable description
    pub description: String,
    /// Tags
    pub tags: Tags,
}

/// Direction of a security rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    /// Inbound traffic
    Ingress,
    /// Outbound traffic
    Egress,
}

/// Who a security rule admits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleSource {
    /// An address range
    Cidr(String),
    /// Members of the same security boundary
    SelfReference,
}

/// One ingress or egress rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRule {
    /// Ingress or egress
    pub direction: RuleDirection,
    /// `tcp`, `udp` or `-1` for all
    pub protocol: String,
    /// First port of the range
    pub from_port: u16,
    /// Last port of the range
    pub to_port: u16,
    /// Admitted source
    pub source: RuleSource,
}

impl SecurityRule {
    /// TCP ingress on a port range from a CIDR
    pub fn tcp_ingress(from_port: u16, to_port: u16, cidr: &str) -> Self {
        Self {
            direction: RuleDirection::Ingress,
            protocol: "tcp".to_string(),
            from_port,
            to_port,
            source: RuleSource::Cidr(cidr.to_string()),
        }
    }

    /// All traffic between members of the boundary
    pub fn intra_cluster() -> Self {
        Self {
            direction: RuleDirection::Ingress,
            protocol: "-1".to_string(),
            from_port: 0,
            to_port: 65535,
            source: RuleSource::SelfReference,
        }
    }

    /// All outbound traffic
    pub fn egress_all() -> Self {
        Self {
            direction: RuleDirection::Egress,
            protocol: "-1".to_string(),
            from_port: 0,
            to_port: 65535,
            source: RuleSource::Cidr("0.0.0.0/0".to_string()),
        }
    }
}

/// Create a compute node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRequest {
    /// Node name
    pub name: String,
    /// Role tag value
    pub role: NodeRole,
    /// Node-group of a worker
    pub node_group: Option<String>,
    /// Backend machine class
    pub machine_class: String,
    /// Network to place the node in
    pub network_id: String,
    /// Security boundaries to attach
    pub security_boundary_ids: Vec<String>,
    /// Base64-encoded bootstrap payload
    pub bootstrap_payload: String,
    /// Tags
    pub tags: Tags,
}

/// Allocate a public address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRequest {
    /// Resource name
    pub name: String,
    /// Tags
    pub tags: Tags,
}

/// Create a load balancer in front of nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerRequest {
    /// Resource name
    pub name: String,
    /// Network the targets live in
    pub network_id: String,
    /// Target node ids
    pub target_node_ids: Vec<String>,
    /// Listener ports forwarded to the targets
    pub ports: Vec<u16>,
    /// Tags
    pub tags: Tags,
}

/// Create a block storage volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRequest {
    /// Resource name
    pub name: String,
    /// Size in GiB
    pub size_gib: u32,
    /// Node to attach the volume to once created
    pub attach_to: Option<String>,
    /// Tags
    pub tags: Tags,
}

/// Where to run a remote command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Node id, for error reporting
    pub node_id: String,
    /// Address to connect to
    pub address: String,
    /// Short-lived credential
    pub credential: NodeCredential,
}

/// How [`Backend::find_resources`] matches resources
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceQuery {
    /// Resources carrying every one of these tags
    Tags(Tags),
    /// Resources whose name starts with this prefix
    NamePrefix(String),
}

// =============================================================================
// Responses
// =============================================================================

/// Result of creating a network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Network container id
    pub network_id: String,
    /// Subdivisions created with it (subnets, route tables, gateways)
    pub resources: Vec<ResourceRef>,
}

/// Availability of a network
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkState {
    /// Still being set up
    Pending,
    /// Usable
    Available,
}

/// Described security boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityBoundaryInfo {
    /// Id
    pub id: String,
    /// Name
    pub name: String,
    /// Default boundary the backend created with the network
    pub is_default: bool,
    /// Number of ingress plus egress rules
    pub rule_count: usize,
}

/// Described routing table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTableInfo {
    /// Id
    pub id: String,
    /// The network's main table
    pub is_main: bool,
}

/// Lifecycle phase of a compute node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    /// Starting
    Pending,
    /// Up
    Running,
    /// Being terminated
    ShuttingDown,
    /// Gone
    Terminated,
}

/// Described compute node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeState {
    /// Id
    pub id: String,
    /// Phase
    pub phase: NodePhase,
    /// Private address, once assigned
    pub private_address: Option<String>,
    /// Public address, once assigned
    pub public_address: Option<String>,
    /// Machine class
    pub machine_class: String,
}

impl NodeState {
    /// Whether the backend assigned any address yet
    pub fn has_address(&self) -> bool {
        self.private_address.is_some() || self.public_address.is_some()
    }
}

/// Output of a remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code
    pub exit_code: i32,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Exit code zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Allocated public address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    /// Allocation id
    pub id: String,
    /// The public IP
    pub public_ip: String,
    /// Resource (node or interface) it is bound to
    pub associated_with: Option<String>,
}

/// Described network interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Id
    pub id: String,
    /// Node it is attached to
    pub attached_to: Option<String>,
}

/// Created load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerInfo {
    /// Id
    pub id: String,
    /// Public DNS name
    pub dns_name: String,
}

/// Described block storage volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Id
    pub id: String,
    /// Size in GiB
    pub size_gib: u32,
    /// Node it is attached to
    pub attached_to: Option<String>,
}

/// A resource found by [`Backend::find_resources`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Class and id
    pub resource: ResourceRef,
    /// Resource name
    pub name: String,
    /// Tags
    pub tags: Tags,
}

// =============================================================================
// Capability trait
// =============================================================================

/// Operations the orchestration core needs from an infrastructure provider
///
/// `describe_*` calls return `Ok(None)` for resources that no longer exist.
/// Delete calls may return `Error::NotFound`, which callers treat as success,
/// and `Error::DependencyViolation` when live resources still reference the
/// target.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend identifier (`aws`, `hetzner`, `ssh`, ...)
    fn name(&self) -> String;

    /// Region or location resources are created in
    fn region(&self) -> String;

    // ---- identity ----

    /// Check the configured credentials are accepted
    async fn verify_identity(&self) -> Result<()>;

    /// Check the credentials may create everything a cluster needs
    async fn validate_permissions(&self) -> Result<()>;

    // ---- network ----

    /// Create a network container plus subnets, route tables and gateways
    async fn create_network(&self, request: &NetworkRequest) -> Result<NetworkInfo>;

    /// Describe a network
    async fn describe_network(&self, network_id: &str) -> Result<Option<NetworkState>>;

    /// Delete a network container
    async fn delete_network(&self, network_id: &str) -> Result<()>;

    /// Delete a subnet
    async fn delete_subnet(&self, subnet_id: &str) -> Result<()>;

    /// Describe a routing table
    async fn describe_route_table(&self, route_table_id: &str) -> Result<Option<RouteTableInfo>>;

    /// Delete a routing table
    async fn delete_route_table(&self, route_table_id: &str) -> Result<()>;

    /// Delete a NAT/outbound gateway
    async fn delete_nat_gateway(&self, gateway_id: &str) -> Result<()>;

    /// Detach an internet gateway from a network
    async fn detach_internet_gateway(&self, gateway_id: &str, network_id: &str) -> Result<()>;

    /// Delete an internet gateway
    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<()>;

    // ---- security ----

    /// Create a security boundary
    async fn create_security_boundary(&self, request: &SecurityBoundaryRequest)
        -> Result<String>;

    /// Describe a security boundary
    async fn describe_security_boundary(&self, id: &str) -> Result<Option<SecurityBoundaryInfo>>;

    /// Add rules to a security boundary
    async fn authorize_rules(&self, id: &str, rules: &[SecurityRule]) -> Result<()>;

    /// Remove every ingress and egress rule
    async fn revoke_all_rules(&self, id: &str) -> Result<()>;

    /// Delete a security boundary
    async fn delete_security_boundary(&self, id: &str) -> Result<()>;

    // ---- compute ----

    /// Create a compute node
    async fn create_node(&self, request: &NodeRequest) -> Result<NodeInfo>;

    /// Describe a compute node
    async fn describe_node(&self, node_id: &str) -> Result<Option<NodeState>>;

    /// Request termination of a compute node
    async fn terminate_node(&self, node_id: &str) -> Result<()>;

    /// Snapshot a node's root volume, returning the snapshot id
    async fn snapshot_node(&self, node_id: &str, tags: &Tags) -> Result<String>;

    // ---- remote execution ----

    /// Issue a short-lived credential for remote execution on a node
    async fn issue_credential(&self, node: &NodeInfo) -> Result<NodeCredential>;

    /// Run a shell command on a node
    async fn run_command(&self, target: &RemoteTarget, command: &str) -> Result<CommandOutput>;

    // ---- addressing ----

    /// Allocate a public address
    async fn allocate_address(&self, request: &AddressRequest) -> Result<AddressInfo>;

    /// Describe an allocated address
    async fn describe_address(&self, address_id: &str) -> Result<Option<AddressInfo>>;

    /// Bind an address to a node
    async fn associate_address(&self, address_id: &str, node_id: &str) -> Result<()>;

    /// Unbind an address
    async fn disassociate_address(&self, address_id: &str) -> Result<()>;

    /// Release an address
    async fn release_address(&self, address_id: &str) -> Result<()>;

    // ---- interfaces ----

    /// Describe a network interface
    async fn describe_interface(&self, interface_id: &str) -> Result<Option<InterfaceInfo>>;

    /// Delete a network interface
    async fn delete_interface(&self, interface_id: &str) -> Result<()>;

    // ---- capacity ----

    /// Create a load balancer
    async fn create_load_balancer(&self, request: &LoadBalancerRequest)
        -> Result<LoadBalancerInfo>;

    /// Describe a load balancer
    async fn describe_load_balancer(&self, id: &str) -> Result<Option<LoadBalancerInfo>>;

    /// Delete a load balancer
    async fn delete_load_balancer(&self, id: &str) -> Result<()>;

    /// Create a block storage volume, attached to a node when requested
    async fn create_volume(&self, request: &VolumeRequest) -> Result<VolumeInfo>;

    /// Describe a block storage volume
    async fn describe_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>>;

    /// Delete a block storage volume
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    // ---- discovery ----

    /// Find resources of any class matching a query
    async fn find_resources(&self, query: &ResourceQuery) -> Result<Vec<DiscoveredResource>>;
}
