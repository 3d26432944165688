//! In-memory backend for tests
//!
//! Keeps every created resource in memory, records each call in order, and
//! lets tests script failures and remote command output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use kubeforge_common::types::{NodeCredential, NodeInfo, ResourceClass, ResourceRef, Tags};
use kubeforge_common::{Error, Result};

use crate::backend::*;

pub(crate) const CERT_KEY: &str =
    "2a1c8f5e4b9d7a6c3e0f1b2d4c6e8a0b1c3d5e7f9a1b3c5d7e9f0a2b4c6d8e0f";

struct ScriptedFailure {
    op: String,
    id: Option<String>,
    remaining: Option<u32>,
    error: Error,
}

#[derive(Default)]
struct FakeState {
    counters: HashMap<&'static str, u32>,
    calls: Vec<String>,
    live: HashSet<String>,
    resources: Vec<DiscoveredResource>,
    boundaries: BTreeMap<String, SecurityBoundaryInfo>,
    route_tables: BTreeMap<String, RouteTableInfo>,
    nodes: BTreeMap<String, NodeState>,
    node_names: HashMap<String, String>,
    address_delay: HashMap<String, u32>,
    addresses: BTreeMap<String, AddressInfo>,
    interfaces: BTreeMap<String, InterfaceInfo>,
    volumes: BTreeMap<String, VolumeInfo>,
    load_balancers: BTreeMap<String, LoadBalancerInfo>,
    failures: Vec<ScriptedFailure>,
    responses: Vec<(String, CommandOutput)>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &'static str) -> String {
        let n = self.counters.entry(prefix).or_insert(0);
        *n += 1;
        format!("{}-{}", prefix, n)
    }

    fn call(&mut self, op: &str, arg: &str) -> Result<()> {
        self.calls.push(format!("{}:{}", op, arg));
        let pos = self
            .failures
            .iter()
            .position(|f| f.op == op && f.id.as_deref().map(|id| id == arg).unwrap_or(true));
        let Some(pos) = pos else { return Ok(()) };

        let error = self.failures[pos].error.clone();
        let exhausted = match self.failures[pos].remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(pos);
        }
        Err(error)
    }

    fn add(&mut self, class: ResourceClass, id: &str, name: &str, tags: &Tags) {
        self.live.insert(id.to_string());
        self.resources.push(DiscoveredResource {
            resource: ResourceRef::new(class, id),
            name: name.to_string(),
            tags: tags.clone(),
        });
    }

    fn remove(&mut self, class: ResourceClass, id: &str) -> Result<()> {
        if !self.live.remove(id) {
            return Err(Error::not_found(class.as_str(), id));
        }
        self.resources.retain(|r| r.resource.id != id);
        Ok(())
    }

    fn add_node(&mut self, id: &str, name: &str, machine_class: &str) {
        self.node_names.insert(id.to_string(), name.to_string());
        self.nodes.insert(
            id.to_string(),
            NodeState {
                id: id.to_string(),
                phase: NodePhase::Pending,
                private_address: None,
                public_address: None,
                machine_class: machine_class.to_string(),
            },
        );
    }
}

/// In-memory [`Backend`] with a call log and scripted failures
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    // ---- scripting ----

    /// Fail every call to `op`
    pub fn fail(&self, op: &str, error: Error) {
        self.lock().failures.push(ScriptedFailure {
            op: op.to_string(),
            id: None,
            remaining: None,
            error,
        });
    }

    /// Fail the next `times` calls to `op` for `id`
    pub fn fail_times(&self, op: &str, id: &str, times: u32, error: Error) {
        self.lock().failures.push(ScriptedFailure {
            op: op.to_string(),
            id: Some(id.to_string()),
            remaining: Some(times),
            error,
        });
    }

    /// Reject the next `times` deletes of a resource with a dependency violation
    pub fn dependency_violations(&self, op: &str, class: ResourceClass, id: &str, times: u32) {
        self.fail_times(
            op,
            id,
            times,
            Error::dependency_violation(class, id, "resource has a dependent object"),
        );
    }

    /// Answer commands containing `pattern` with `output`
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.lock().responses.push((pattern.to_string(), output));
    }

    // ---- seeding ----

    /// Add an existing resource
    pub fn seed(&self, class: ResourceClass, id: &str, name: &str, tags: Tags) {
        let mut state = self.lock();
        state.add(class, id, name, &tags);
        match class {
            ResourceClass::ComputeNode => {
                state.add_node(id, name, "t3.medium");
                let n = state.nodes.len();
                if let Some(node) = state.nodes.get_mut(id) {
                    node.phase = NodePhase::Running;
                    node.private_address = Some(format!("10.0.1.{}", n));
                }
            }
            ResourceClass::SecurityBoundary => {
                state.boundaries.insert(
                    id.to_string(),
                    SecurityBoundaryInfo {
                        id: id.to_string(),
                        name: name.to_string(),
                        is_default: false,
                        rule_count: 2,
                    },
                );
            }
            ResourceClass::RouteTable => {
                state.route_tables.insert(
                    id.to_string(),
                    RouteTableInfo {
                        id: id.to_string(),
                        is_main: false,
                    },
                );
            }
            ResourceClass::Volume => {
                state.volumes.insert(
                    id.to_string(),
                    VolumeInfo {
                        id: id.to_string(),
                        size_gib: 20,
                        attached_to: None,
                    },
                );
            }
            ResourceClass::LoadBalancer => {
                state.load_balancers.insert(
                    id.to_string(),
                    LoadBalancerInfo {
                        id: id.to_string(),
                        dns_name: format!("{}.lb.example.com", id),
                    },
                );
            }
            ResourceClass::Address => {
                state.addresses.insert(
                    id.to_string(),
                    AddressInfo {
                        id: id.to_string(),
                        public_ip: "54.1.0.100".to_string(),
                        associated_with: None,
                    },
                );
            }
            ResourceClass::NetworkInterface => {
                state.interfaces.insert(
                    id.to_string(),
                    InterfaceInfo {
                        id: id.to_string(),
                        attached_to: None,
                    },
                );
            }
            _ => {}
        }
    }

    /// Add a node with an explicit state
    pub fn insert_node(&self, node: NodeState) {
        let mut state = self.lock();
        state.live.insert(node.id.clone());
        state.node_names.insert(node.id.clone(), node.id.clone());
        state.nodes.insert(node.id.clone(), node);
    }

    pub fn set_node_phase(&self, id: &str, phase: NodePhase) {
        if let Some(node) = self.lock().nodes.get_mut(id) {
            node.phase = phase;
        }
    }

    /// Keep a node address-less for the next `polls` describes
    pub fn assign_address_after(&self, id: &str, polls: u32) {
        self.lock().address_delay.insert(id.to_string(), polls);
    }

    pub fn mark_default_boundary(&self, id: &str) {
        if let Some(sg) = self.lock().boundaries.get_mut(id) {
            sg.is_default = true;
        }
    }

    pub fn mark_main_route_table(&self, id: &str) {
        if let Some(rt) = self.lock().route_tables.get_mut(id) {
            rt.is_main = true;
        }
    }

    pub fn bind_address(&self, address_id: &str, resource_id: &str) {
        if let Some(addr) = self.lock().addresses.get_mut(address_id) {
            addr.associated_with = Some(resource_id.to_string());
        }
    }

    pub fn attach_interface(&self, interface_id: &str, node_id: &str) {
        if let Some(eni) = self.lock().interfaces.get_mut(interface_id) {
            eni.attached_to = Some(node_id.to_string());
        }
    }

    // ---- inspection ----

    /// Every call, as `op:arg`, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls exactly matching `op:arg`
    pub fn count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Index of the first call starting with `prefix`
    pub fn first_call(&self, prefix: &str) -> Option<usize> {
        self.lock().calls.iter().position(|c| c.starts_with(prefix))
    }

    /// Index of the last call starting with `prefix`
    pub fn last_call(&self, prefix: &str) -> Option<usize> {
        self.lock().calls.iter().rposition(|c| c.starts_with(prefix))
    }

    pub fn ran_command_containing(&self, pattern: &str) -> bool {
        self.lock()
            .calls
            .iter()
            .any(|c| c.starts_with("run_command:") && c.contains(pattern))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().live.contains(id)
    }

    pub fn running_nodes(&self) -> usize {
        self.lock()
            .nodes
            .values()
            .filter(|n| matches!(n.phase, NodePhase::Pending | NodePhase::Running))
            .count()
    }

    fn admin_conf() -> String {
        "apiVersion: v1\nkind: Config\nclusters:\n- name: kubernetes\n  cluster:\n    server: https://10.0.1.1:6443\n    certificate-authority-data: Q0E=\nusers:\n- name: kubernetes-admin\n  user:\n    client-certificate-data: Y2VydA==\n    client-key-data: a2V5\ncontexts:\n- name: kubernetes-admin@kubernetes\n  context:\n    cluster: kubernetes\n    user: kubernetes-admin\ncurrent-context: kubernetes-admin@kubernetes\n".to_string()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> String {
        "fake".to_string()
    }

    fn region(&self) -> String {
        "local-1".to_string()
    }

    async fn verify_identity(&self) -> Result<()> {
        self.lock().call("verify_identity", "")
    }

    async fn validate_permissions(&self) -> Result<()> {
        self.lock().call("validate_permissions", "")
    }

    async fn create_network(&self, request: &NetworkRequest) -> Result<NetworkInfo> {
        let mut state = self.lock();
        state.call("create_network", &request.name)?;
        let network_id = state.next_id("vpc");
        state.add(ResourceClass::Network, &network_id, &request.name, &request.tags);

        let subnet = state.next_id("subnet");
        state.add(ResourceClass::Subnet, &subnet, &format!("{}-subnet", request.name), &request.tags);
        let route_table = state.next_id("rtb");
        state.add(ResourceClass::RouteTable, &route_table, &format!("{}-public", request.name), &request.tags);
        state.route_tables.insert(
            route_table.clone(),
            RouteTableInfo {
                id: route_table.clone(),
                is_main: false,
            },
        );
        let gateway = state.next_id("igw");
        state.add(ResourceClass::InternetGateway, &gateway, &format!("{}-igw", request.name), &request.tags);

        Ok(NetworkInfo {
            network_id,
            resources: vec![
                ResourceRef::new(ResourceClass::Subnet, subnet),
                ResourceRef::new(ResourceClass::RouteTable, route_table),
                ResourceRef::new(ResourceClass::InternetGateway, gateway),
            ],
        })
    }

    async fn describe_network(&self, network_id: &str) -> Result<Option<NetworkState>> {
        let mut state = self.lock();
        state.call("describe_network", network_id)?;
        Ok(state.live.contains(network_id).then_some(NetworkState::Available))
    }

    async fn delete_network(&self, network_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_network", network_id)?;
        state.remove(ResourceClass::Network, network_id)
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_subnet", subnet_id)?;
        state.remove(ResourceClass::Subnet, subnet_id)
    }

    async fn describe_route_table(&self, route_table_id: &str) -> Result<Option<RouteTableInfo>> {
        let mut state = self.lock();
        state.call("describe_route_table", route_table_id)?;
        Ok(state.route_tables.get(route_table_id).cloned())
    }

    async fn delete_route_table(&self, route_table_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_route_table", route_table_id)?;
        state.route_tables.remove(route_table_id);
        state.remove(ResourceClass::RouteTable, route_table_id)
    }

    async fn delete_nat_gateway(&self, gateway_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_nat_gateway", gateway_id)?;
        state.remove(ResourceClass::NatGateway, gateway_id)
    }

    async fn detach_internet_gateway(&self, gateway_id: &str, _network_id: &str) -> Result<()> {
        self.lock().call("detach_internet_gateway", gateway_id)
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_internet_gateway", gateway_id)?;
        state.remove(ResourceClass::InternetGateway, gateway_id)
    }

    async fn create_security_boundary(&self, request: &SecurityBoundaryRequest) -> Result<String> {
        let mut state = self.lock();
        state.call("create_security_boundary", &request.name)?;
        let id = state.next_id("sg");
        state.add(ResourceClass::SecurityBoundary, &id, &request.name, &request.tags);
        state.boundaries.insert(
            id.clone(),
            SecurityBoundaryInfo {
                id: id.clone(),
                name: request.name.clone(),
                is_default: false,
                rule_count: 0,
            },
        );
        Ok(id)
    }

    async fn describe_security_boundary(&self, id: &str) -> Result<Option<SecurityBoundaryInfo>> {
        let mut state = self.lock();
        state.call("describe_security_boundary", id)?;
        Ok(state.boundaries.get(id).cloned())
    }

    async fn authorize_rules(&self, id: &str, rules: &[SecurityRule]) -> Result<()> {
        let mut state = self.lock();
        state.call("authorize_rules", id)?;
        match state.boundaries.get_mut(id) {
            Some(sg) => {
                sg.rule_count += rules.len();
                Ok(())
            }
            None => Err(Error::not_found("security-boundary", id)),
        }
    }

    async fn revoke_all_rules(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("revoke_all_rules", id)?;
        if let Some(sg) = state.boundaries.get_mut(id) {
            sg.rule_count = 0;
        }
        Ok(())
    }

    async fn delete_security_boundary(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_security_boundary", id)?;
        state.boundaries.remove(id);
        state.remove(ResourceClass::SecurityBoundary, id)
    }

    async fn create_node(&self, request: &NodeRequest) -> Result<NodeInfo> {
        let mut state = self.lock();
        state.call("create_node", &request.name)?;
        let id = state.next_id("i");
        state.add(ResourceClass::ComputeNode, &id, &request.name, &request.tags);
        state.add_node(&id, &request.name, &request.machine_class);
        Ok(NodeInfo {
            id,
            name: request.name.clone(),
            private_address: None,
            public_address: None,
            machine_class: request.machine_class.clone(),
            role: request.role,
            node_group: request.node_group.clone(),
            credential: None,
        })
    }

    async fn describe_node(&self, node_id: &str) -> Result<Option<NodeState>> {
        let mut state = self.lock();
        state.call("describe_node", node_id)?;

        if let Some(remaining) = state.address_delay.get_mut(node_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(state.nodes.get(node_id).cloned());
            }
        }

        let index = state.nodes.keys().position(|k| k == node_id).unwrap_or(0) + 1;
        let Some(node) = state.nodes.get_mut(node_id) else {
            return Ok(None);
        };
        let reported = node.clone();
        match node.phase {
            NodePhase::Pending => {
                node.phase = NodePhase::Running;
                node.private_address = Some(format!("10.0.1.{}", index));
                node.public_address = Some(format!("54.0.0.{}", index));
                return Ok(Some(node.clone()));
            }
            NodePhase::ShuttingDown => node.phase = NodePhase::Terminated,
            _ => {}
        }
        Ok(Some(reported))
    }

    async fn terminate_node(&self, node_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("terminate_node", node_id)?;
        match state.nodes.get_mut(node_id) {
            Some(node) => {
                if node.phase != NodePhase::Terminated {
                    node.phase = NodePhase::ShuttingDown;
                }
            }
            None => return Err(Error::not_found("compute-node", node_id)),
        }
        state.live.remove(node_id);
        state.resources.retain(|r| r.resource.id != node_id);
        for volume in state.volumes.values_mut() {
            if volume.attached_to.as_deref() == Some(node_id) {
                volume.attached_to = None;
            }
        }
        Ok(())
    }

    async fn snapshot_node(&self, node_id: &str, _tags: &Tags) -> Result<String> {
        let mut state = self.lock();
        state.call("snapshot_node", node_id)?;
        Ok(state.next_id("snap"))
    }

    async fn issue_credential(&self, node: &NodeInfo) -> Result<NodeCredential> {
        self.lock().call("issue_credential", &node.id)?;
        Ok(NodeCredential {
            username: "ubuntu".to_string(),
            private_key: "fake-key".to_string(),
            expires_at: None,
        })
    }

    async fn run_command(&self, target: &RemoteTarget, command: &str) -> Result<CommandOutput> {
        let mut state = self.lock();
        state.call("run_command", &format!("{}:{}", target.node_id, command))?;
        if let Some(err) = state
            .failures
            .iter()
            .find(|f| f.op == "run_command" && f.id.as_deref() == Some(target.node_id.as_str()))
        {
            return Err(err.error.clone());
        }

        if let Some((_, output)) = state
            .responses
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        {
            return Ok(output.clone());
        }

        let output = if command.contains("token create --print-join-command") {
            CommandOutput::ok(
                "kubeadm join 10.0.1.1:6443 --token abcdef.0123456789abcdef \
                 --discovery-token-ca-cert-hash sha256:9f86d081884c7d659a2feaa0c55ad015\n",
            )
        } else if command.contains("upload-certs") {
            CommandOutput::ok(format!(
                "[upload-certs] Using certificate key:\n{}\n",
                CERT_KEY
            ))
        } else if command.contains("cat /etc/kubernetes/admin.conf") {
            CommandOutput::ok(Self::admin_conf())
        } else if command.contains("get nodes") {
            let lines: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.phase == NodePhase::Running)
                .map(|(id, _)| {
                    let name = state.node_names.get(id).cloned().unwrap_or_default();
                    format!("{}   Ready    <none>   5m   v1.30.2", name)
                })
                .collect();
            CommandOutput::ok(lines.join("\n"))
        } else if command.contains("top nodes") {
            let lines: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.phase == NodePhase::Running)
                .map(|(id, _)| {
                    let name = state.node_names.get(id).cloned().unwrap_or_default();
                    format!("{}   250m   12%   1024Mi   27%", name)
                })
                .collect();
            CommandOutput::ok(lines.join("\n"))
        } else {
            CommandOutput::ok("")
        };
        Ok(output)
    }

    async fn allocate_address(&self, request: &AddressRequest) -> Result<AddressInfo> {
        let mut state = self.lock();
        state.call("allocate_address", &request.name)?;
        let id = state.next_id("eipalloc");
        let n = state.counters.get("eipalloc").copied().unwrap_or(0);
        state.add(ResourceClass::Address, &id, &request.name, &request.tags);
        let info = AddressInfo {
            id: id.clone(),
            public_ip: format!("54.1.0.{}", n),
            associated_with: None,
        };
        state.addresses.insert(id, info.clone());
        Ok(info)
    }

    async fn describe_address(&self, address_id: &str) -> Result<Option<AddressInfo>> {
        let mut state = self.lock();
        state.call("describe_address", address_id)?;
        Ok(state.addresses.get(address_id).cloned())
    }

    async fn associate_address(&self, address_id: &str, node_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("associate_address", address_id)?;
        let ip = match state.addresses.get_mut(address_id) {
            Some(addr) => {
                addr.associated_with = Some(node_id.to_string());
                addr.public_ip.clone()
            }
            None => return Err(Error::not_found("address", address_id)),
        };
        if let Some(node) = state.nodes.get_mut(node_id) {
            node.public_address = Some(ip);
        }
        Ok(())
    }

    async fn disassociate_address(&self, address_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("disassociate_address", address_id)?;
        if let Some(addr) = state.addresses.get_mut(address_id) {
            addr.associated_with = None;
        }
        Ok(())
    }

    async fn release_address(&self, address_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("release_address", address_id)?;
        if let Some(addr) = state.addresses.get(address_id) {
            if addr.associated_with.is_some() {
                return Err(Error::dependency_violation(
                    ResourceClass::Address,
                    address_id,
                    "address is still associated",
                ));
            }
        }
        state.addresses.remove(address_id);
        state.remove(ResourceClass::Address, address_id)
    }

    async fn describe_interface(&self, interface_id: &str) -> Result<Option<InterfaceInfo>> {
        let mut state = self.lock();
        state.call("describe_interface", interface_id)?;
        Ok(state.interfaces.get(interface_id).cloned())
    }

    async fn delete_interface(&self, interface_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_interface", interface_id)?;
        state.interfaces.remove(interface_id);
        state.remove(ResourceClass::NetworkInterface, interface_id)
    }

    async fn create_load_balancer(&self, request: &LoadBalancerRequest) -> Result<LoadBalancerInfo> {
        let mut state = self.lock();
        state.call("create_load_balancer", &request.name)?;
        let id = state.next_id("lb");
        state.add(ResourceClass::LoadBalancer, &id, &request.name, &request.tags);
        let info = LoadBalancerInfo {
            dns_name: format!("{}.lb.example.com", id),
            id: id.clone(),
        };
        state.load_balancers.insert(id, info.clone());
        Ok(info)
    }

    async fn describe_load_balancer(&self, id: &str) -> Result<Option<LoadBalancerInfo>> {
        let mut state = self.lock();
        state.call("describe_load_balancer", id)?;
        Ok(state.load_balancers.get(id).cloned())
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_load_balancer", id)?;
        state.load_balancers.remove(id);
        state.remove(ResourceClass::LoadBalancer, id)
    }

    async fn create_volume(&self, request: &VolumeRequest) -> Result<VolumeInfo> {
        let mut state = self.lock();
        state.call("create_volume", &request.name)?;
        if let Some(ref node) = request.attach_to {
            if !state.live.contains(node) {
                return Err(Error::not_found("compute-node", node.as_str()));
            }
        }
        let id = state.next_id("vol");
        state.add(ResourceClass::Volume, &id, &request.name, &request.tags);
        let info = VolumeInfo {
            id: id.clone(),
            size_gib: request.size_gib,
            attached_to: request.attach_to.clone(),
        };
        state.volumes.insert(id, info.clone());
        Ok(info)
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>> {
        let mut state = self.lock();
        state.call("describe_volume", volume_id)?;
        Ok(state.volumes.get(volume_id).cloned())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.call("delete_volume", volume_id)?;
        if let Some(node) = state
            .volumes
            .get(volume_id)
            .and_then(|v| v.attached_to.clone())
        {
            return Err(Error::dependency_violation(
                ResourceClass::Volume,
                volume_id,
                format!("volume is attached to {}", node),
            ));
        }
        state.volumes.remove(volume_id);
        state.remove(ResourceClass::Volume, volume_id)
    }

    async fn find_resources(&self, query: &ResourceQuery) -> Result<Vec<DiscoveredResource>> {
        let mut state = self.lock();
        state.call("find_resources", "")?;
        let found = state
            .resources
            .iter()
            .filter(|r| match query {
                ResourceQuery::Tags(tags) => tags.iter().all(|(k, v)| r.tags.get(k) == Some(v)),
                ResourceQuery::NamePrefix(prefix) => r.name.starts_with(prefix.as_str()),
            })
            .cloned()
            .collect();
        Ok(found)
    }
}
