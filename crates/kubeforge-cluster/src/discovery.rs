//! Tag-based discovery of a cluster's resources
//!
//! Used when no tracker was persisted (process restart, or clusters created
//! outside kubeforge). Strategies run from strictest to loosest; for each
//! resource class the first strategy that finds anything wins and looser
//! strategies are ignored for that class.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tracing::{debug, info, instrument, warn};

use kubeforge_common::types::{
    validate_dns_label, ClusterInfrastructure, NodeInfo, NodeRole, ResourceClass, Tags,
};
use kubeforge_common::{
    legacy_cluster_tag, Result, CLUSTER_TAG, LEGACY_CLUSTER_TAG_PREFIX, LEGACY_CLUSTER_TAG_VALUE,
    MANAGED_BY_TAG, MANAGED_BY_VALUE, NODE_GROUP_TAG, ROLE_TAG,
};

use crate::backend::{Backend, DiscoveredResource, NodePhase, ResourceQuery};
use crate::tracker::ResourceTracker;

/// Ways a resource can be attributed to a cluster, strictest first
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    /// `kubeforge.io/managed-by=kubeforge` plus `kubeforge.io/cluster=<name>`
    ManagedTags,
    /// `kubernetes.io/cluster/<name>=owned`
    LegacyTag,
    /// Name starts with `<name>-`
    NamePrefix,
}

impl DiscoveryStrategy {
    /// Every strategy in precedence order
    pub const ORDER: [DiscoveryStrategy; 3] = [
        DiscoveryStrategy::ManagedTags,
        DiscoveryStrategy::LegacyTag,
        DiscoveryStrategy::NamePrefix,
    ];

    /// Backend query implementing this strategy
    pub fn query(&self, cluster: &str) -> ResourceQuery {
        match self {
            Self::ManagedTags => {
                let mut tags = Tags::new();
                tags.insert(MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string());
                tags.insert(CLUSTER_TAG.to_string(), cluster.to_string());
                ResourceQuery::Tags(tags)
            }
            Self::LegacyTag => {
                let mut tags = Tags::new();
                tags.insert(
                    legacy_cluster_tag(cluster),
                    LEGACY_CLUSTER_TAG_VALUE.to_string(),
                );
                ResourceQuery::Tags(tags)
            }
            Self::NamePrefix => ResourceQuery::NamePrefix(format!("{}-", cluster)),
        }
    }
}

impl fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagedTags => write!(f, "managed-tags"),
            Self::LegacyTag => write!(f, "legacy-tag"),
            Self::NamePrefix => write!(f, "name-prefix"),
        }
    }
}

/// Resources attributed to a cluster, grouped by class
async fn discover_resources(
    backend: &dyn Backend,
    cluster: &str,
) -> Result<BTreeMap<ResourceClass, Vec<DiscoveredResource>>> {
    let mut by_class: BTreeMap<ResourceClass, Vec<DiscoveredResource>> = BTreeMap::new();

    for strategy in DiscoveryStrategy::ORDER {
        let found = backend.find_resources(&strategy.query(cluster)).await?;
        let mut per_class: BTreeMap<ResourceClass, Vec<DiscoveredResource>> = BTreeMap::new();
        for resource in found {
            if strategy == DiscoveryStrategy::NamePrefix && belongs_elsewhere(&resource, cluster) {
                debug!(
                    cluster = %cluster,
                    resource = %resource.resource,
                    name = %resource.name,
                    "Ignoring name match not attributable to this cluster"
                );
                continue;
            }
            per_class
                .entry(resource.resource.class)
                .or_default()
                .push(resource);
        }

        for (class, resources) in per_class {
            if by_class.contains_key(&class) {
                continue;
            }
            debug!(
                cluster = %cluster,
                strategy = %strategy,
                class = %class,
                count = resources.len(),
                "Discovered resources"
            );
            by_class.insert(class, resources);
        }
    }

    Ok(by_class)
}

/// Rebuild a tracker from the backend's tags
#[instrument(skip(backend), fields(backend = %backend.name()))]
pub async fn discover(backend: &dyn Backend, cluster: &str) -> Result<ResourceTracker> {
    let by_class = discover_resources(backend, cluster).await?;

    let mut tracker = ResourceTracker::new(cluster, backend.region());
    let mut seen = HashSet::new();
    for resource in by_class.values().flatten() {
        if !seen.insert(resource.resource.id.clone()) {
            continue;
        }
        if let Err(e) = tracker.record_ref(&resource.resource) {
            warn!(cluster = %cluster, error = %e, "Skipping ambiguous discovered resource");
        }
    }

    info!(cluster = %cluster, resources = tracker.len(), "Rebuilt resource tracker from backend");
    Ok(tracker)
}

/// Rebuild a cluster's topology from tagged compute nodes
///
/// Terminated nodes are skipped. Control-plane nodes are ordered by name so
/// the node that initialized the cluster (`<name>-cp-0`) comes first.
#[instrument(skip(backend), fields(backend = %backend.name()))]
pub async fn discover_infrastructure(
    backend: &dyn Backend,
    cluster: &str,
) -> Result<ClusterInfrastructure> {
    let by_class = discover_resources(backend, cluster).await?;
    let ids = |class: ResourceClass| -> Vec<String> {
        by_class
            .get(&class)
            .map(|r| r.iter().map(|d| d.resource.id.clone()).collect())
            .unwrap_or_default()
    };

    let mut infra = ClusterInfrastructure {
        network_id: ids(ResourceClass::Network).into_iter().next(),
        security_boundary_ids: ids(ResourceClass::SecurityBoundary),
        ..Default::default()
    };

    for resource in by_class.get(&ResourceClass::ComputeNode).into_iter().flatten() {
        let Some(state) = backend.describe_node(&resource.resource.id).await? else {
            continue;
        };
        if matches!(state.phase, NodePhase::ShuttingDown | NodePhase::Terminated) {
            continue;
        }

        let role = node_role(resource);
        let node = NodeInfo {
            id: state.id,
            name: resource.name.clone(),
            private_address: state.private_address,
            public_address: state.public_address,
            machine_class: state.machine_class,
            role,
            node_group: resource.tags.get(NODE_GROUP_TAG).cloned(),
            credential: None,
        };
        match role {
            NodeRole::ControlPlane => infra.control_plane.push(node),
            NodeRole::Worker => infra.workers.push(node),
        }
    }

    infra.control_plane.sort_by(|a, b| a.name.cmp(&b.name));
    infra.workers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infra)
}

/// Role from the role tag, falling back to the `-cp-` naming convention
fn node_role(resource: &DiscoveredResource) -> NodeRole {
    if let Some(role) = resource.tags.get(ROLE_TAG) {
        if let Ok(role) = role.parse() {
            return role;
        }
    }
    if resource.name.contains("-cp-") {
        NodeRole::ControlPlane
    } else {
        NodeRole::Worker
    }
}

/// Whether a name-prefix match must not be adopted
///
/// `dev` is a prefix of `dev-b`, so a match counts only when no ownership tag
/// names another cluster and the rest of the name is one kubeforge gives
/// the resource's class.
fn belongs_elsewhere(resource: &DiscoveredResource, cluster: &str) -> bool {
    if resource.tags.get(CLUSTER_TAG).is_some_and(|owner| owner != cluster) {
        return true;
    }
    let own_legacy = legacy_cluster_tag(cluster);
    if resource
        .tags
        .keys()
        .any(|key| key.starts_with(LEGACY_CLUSTER_TAG_PREFIX) && *key != own_legacy)
    {
        return true;
    }
    let rest = resource
        .name
        .strip_prefix(cluster)
        .and_then(|rest| rest.strip_prefix('-'));
    !rest.is_some_and(|rest| follows_naming(resource.resource.class, rest))
}

/// Whether `rest` (the name after `<cluster>-`) is how kubeforge names `class`
fn follows_naming(class: ResourceClass, rest: &str) -> bool {
    match class {
        ResourceClass::Network => rest == "network",
        ResourceClass::SecurityBoundary => rest == "nodes",
        ResourceClass::Address => rest == "api",
        ResourceClass::LoadBalancer => rest == "ingress",
        ResourceClass::ComputeNode => is_node_name(rest),
        ResourceClass::Subnet
        | ResourceClass::RouteTable
        | ResourceClass::InternetGateway
        | ResourceClass::NatGateway => rest
            .strip_prefix("network-")
            .is_some_and(|suffix| !suffix.is_empty()),
        ResourceClass::NetworkInterface | ResourceClass::Volume => rest
            .rsplit_once('-')
            .is_some_and(|(node, suffix)| !suffix.is_empty() && is_node_name(node)),
    }
}

/// `cp-<n>` or `<group>-<n>`
///
/// A group ending in `-cp` would make `dev-b-cp-0` look like a `dev` worker.
fn is_node_name(rest: &str) -> bool {
    let Some((group, index)) = rest.rsplit_once('-') else {
        return false;
    };
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    group == "cp" || (validate_dns_label(group).is_ok() && !group.ends_with("-cp"))
}
