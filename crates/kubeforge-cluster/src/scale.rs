//! Scaling node-groups and the control plane
//!
//! Scale-up creates, bootstraps and joins nodes with freshly issued join
//! credentials. Scale-down drains and deletes the Kubernetes node, then
//! terminates the machine. The primary control-plane node is never removed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use kubeforge_common::config::OrchestratorConfig;
use kubeforge_common::types::{ClusterInfrastructure, ClusterSpec, NodeInfo, NodeRole, ResourceClass};
use kubeforge_common::{Error, Result};

use crate::backend::Backend;
use crate::bootstrap::{commands, BootstrapRole, NodeBootstrap, NodeBootstrapper, RemoteShell};
use crate::provision::{data_volume_request, node_request, NodePlacement, NodeSlot};
use crate::tracker::ResourceTracker;

/// Desired node counts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
    /// Desired control-plane replicas, unchanged when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<u32>,
    /// Desired replicas per node-group; groups not listed are unchanged
    #[serde(default)]
    pub node_groups: BTreeMap<String, u32>,
}

/// What a scale request changes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Control-plane nodes to create
    pub add_control_plane: Vec<NodeSlot>,
    /// Workers to create
    pub add_workers: Vec<NodeSlot>,
    /// Nodes to remove, workers before control plane
    pub remove: Vec<NodeInfo>,
}

impl ScalePlan {
    /// Nothing to do
    pub fn is_empty(&self) -> bool {
        self.add_control_plane.is_empty() && self.add_workers.is_empty() && self.remove.is_empty()
    }
}

/// Index suffix of `<prefix><index>` node names
fn node_index(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Next unused index for nodes named `<prefix><index>`
fn next_index<'a>(nodes: impl Iterator<Item = &'a NodeInfo>, prefix: &str) -> u32 {
    nodes
        .filter_map(|n| node_index(&n.name, prefix))
        .max()
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Highest-indexed nodes first, so the oldest nodes stay
fn newest_first(nodes: &mut [NodeInfo], prefix: &str) {
    nodes.sort_by_key(|n| std::cmp::Reverse(node_index(&n.name, prefix).unwrap_or(0)));
}

/// Compare desired counts against the live topology
pub fn plan(
    spec: &ClusterSpec,
    infra: &ClusterInfrastructure,
    request: &ScaleRequest,
) -> Result<ScalePlan> {
    let mut plan = ScalePlan::default();

    for (group_name, desired) in &request.node_groups {
        let group = spec
            .node_groups
            .iter()
            .find(|g| &g.name == group_name)
            .ok_or_else(|| {
                Error::validation_for(&spec.name, format!("unknown node group '{}'", group_name))
            })?;
        let prefix = format!("{}-{}-", spec.name, group.name);
        let mut current: Vec<NodeInfo> = infra.workers_in_group(&group.name).cloned().collect();
        let count = current.len() as u32;

        if *desired > count {
            let start = next_index(current.iter(), &prefix);
            for i in 0..(*desired - count) {
                plan.add_workers.push(NodeSlot::worker(spec, group, start + i));
            }
        } else if *desired < count {
            newest_first(&mut current, &prefix);
            plan.remove
                .extend(current.into_iter().take((count - desired) as usize));
        }
    }

    if let Some(desired) = request.control_plane {
        if desired == 0 {
            return Err(Error::validation_for(
                &spec.name,
                "control plane replicas must be at least 1",
            ));
        }
        let prefix = format!("{}-cp-", spec.name);
        let count = infra.control_plane.len() as u32;
        if desired > count {
            let start = next_index(infra.control_plane.iter(), &prefix);
            for i in 0..(desired - count) {
                plan.add_control_plane
                    .push(NodeSlot::control_plane(spec, start + i));
            }
        } else if desired < count {
            // The primary is first and never a candidate
            let mut candidates: Vec<NodeInfo> =
                infra.control_plane.iter().skip(1).cloned().collect();
            newest_first(&mut candidates, &prefix);
            plan.remove
                .extend(candidates.into_iter().take((count - desired) as usize));
        }
    }

    Ok(plan)
}

/// Nodes added and removed by a scale operation
#[derive(Clone, Debug, Default)]
pub struct ScaleOutcome {
    /// Nodes created and joined
    pub added: Vec<NodeInfo>,
    /// Nodes drained and terminated
    pub removed: Vec<NodeInfo>,
}

/// Applies scale plans to a running cluster
pub struct Scaler<'a> {
    backend: &'a dyn Backend,
    config: &'a OrchestratorConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Scaler<'a> {
    /// Scaler over a backend
    pub fn new(
        backend: &'a dyn Backend,
        config: &'a OrchestratorConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            backend,
            config,
            cancel,
        }
    }

    /// Apply `plan`, updating `infra` and recording new nodes in `tracker`
    ///
    /// Stops at the first failure; a node that fails to join is terminated.
    #[instrument(skip_all, fields(cluster = %spec.name))]
    pub async fn apply(
        &self,
        spec: &ClusterSpec,
        infra: &mut ClusterInfrastructure,
        tracker: &mut ResourceTracker,
        plan: ScalePlan,
    ) -> Result<ScaleOutcome> {
        let mut outcome = ScaleOutcome::default();
        let primary = infra
            .primary()
            .cloned()
            .ok_or_else(|| Error::not_found("control-plane node", format!("{}-cp-0", spec.name)))?;

        if !plan.add_control_plane.is_empty() || !plan.add_workers.is_empty() {
            let placement = NodePlacement {
                network_id: infra.network_id.clone().ok_or_else(|| {
                    Error::not_found("network", format!("{}-network", spec.name))
                })?,
                security_boundary_id: infra
                    .security_boundary_ids
                    .first()
                    .cloned()
                    .ok_or_else(|| {
                        Error::not_found("security boundary", format!("{}-nodes", spec.name))
                    })?,
            };
            let bootstrapper = NodeBootstrapper::new(self.backend, self.config, self.cancel);
            let credentials = bootstrapper
                .fetch_join_credentials(&primary, !plan.add_control_plane.is_empty())
                .await?;
            infra.join = Some(credentials.clone());

            let slots = plan
                .add_control_plane
                .into_iter()
                .map(|s| (s, BootstrapRole::JoinControlPlane))
                .chain(plan.add_workers.into_iter().map(|s| (s, BootstrapRole::Worker)));
            for (slot, role) in slots {
                if self.cancel.is_cancelled() {
                    return Err(Error::cancelled("scale up"));
                }
                let request = node_request(spec, slot, &placement)?;
                let node = self.backend.create_node(&request).await?;
                tracker.record(ResourceClass::ComputeNode, &node.id)?;
                info!(node = %node.name, id = %node.id, "Created node for scale up");
                if role == BootstrapRole::JoinControlPlane {
                    if let Some(volume) = data_volume_request(spec, &node) {
                        let created = self.backend.create_volume(&volume).await?;
                        tracker.record(ResourceClass::Volume, &created.id)?;
                    }
                }

                let mut boot = NodeBootstrap::new(node, role);
                let joined = async {
                    bootstrapper.wait_ready(&mut boot).await?;
                    bootstrapper.join(&mut boot, &credentials).await
                }
                .await;
                if let Err(e) = joined {
                    warn!(node = %boot.node.name, error = %e, "Scale-up node failed, terminating it");
                    if let Err(te) = self.backend.terminate_node(&boot.node.id).await {
                        warn!(node = %boot.node.name, error = %te, "Failed to terminate node");
                    }
                    return Err(e);
                }

                let node = boot.into_node();
                match node.role {
                    NodeRole::ControlPlane => infra.control_plane.push(node.clone()),
                    NodeRole::Worker => infra.workers.push(node.clone()),
                }
                outcome.added.push(node);
            }
        }

        for node in plan.remove {
            if node.id == primary.id {
                return Err(Error::validation_for(
                    &spec.name,
                    "the primary control-plane node cannot be removed",
                ));
            }
            self.remove_node(&primary, &node).await?;
            infra.control_plane.retain(|n| n.id != node.id);
            infra.workers.retain(|n| n.id != node.id);
            outcome.removed.push(node);
        }

        info!(
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "Scale complete"
        );
        Ok(outcome)
    }

    /// Drain, delete the Kubernetes node, terminate the machine
    ///
    /// A failed drain is logged; the node is going away either way.
    async fn remove_node(&self, primary: &NodeInfo, node: &NodeInfo) -> Result<()> {
        let shell = RemoteShell::new(self.backend);
        if let Err(e) = shell.run(primary, &commands::drain_node(&node.name)).await {
            warn!(node = %node.name, error = %e, "Drain failed, removing node anyway");
        }
        shell.run(primary, &commands::delete_node(&node.name)).await?;
        match self.backend.terminate_node(&node.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        info!(node = %node.name, id = %node.id, "Removed node");
        Ok(())
    }
}
