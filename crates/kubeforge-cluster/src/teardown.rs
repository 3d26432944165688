//! Dependency-ordered teardown of a cluster's resources
//!
//! Resources are deleted in a fixed order that follows real dependency
//! direction: load balancers and compute first, the network container last.
//! Every failure is collected and reported once the whole sequence has run;
//! one stuck resource never blocks attempts on unrelated ones.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kubeforge_common::config::OrchestratorConfig;
use kubeforge_common::retry::{poll_until, sleep_or_cancel, with_retry};
use kubeforge_common::types::{ResourceClass, ResourceRef};
use kubeforge_common::{Error, Result};

use crate::backend::{Backend, NodePhase};
use crate::tracker::ResourceTracker;

/// A resource teardown deliberately left alone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedResource {
    /// The resource
    pub resource: ResourceRef,
    /// Why it was left
    pub reason: String,
}

/// Outcome of a teardown run
#[derive(Clone, Debug, Default)]
pub struct TeardownReport {
    /// Resources deleted, or already gone
    pub deleted: Vec<ResourceRef>,
    /// Resources intentionally not deleted
    pub skipped: Vec<SkippedResource>,
    /// Per-resource failures, never fatal
    pub errors: Vec<Error>,
}

impl TeardownReport {
    /// No failures were collected
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Failures rendered as warning strings
    pub fn warnings(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    /// Whether a resource ended up deleted
    pub fn was_deleted(&self, class: ResourceClass, id: &str) -> bool {
        self.deleted.iter().any(|r| r.class == class && r.id == id)
    }

    fn skip(&mut self, class: ResourceClass, id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(class = %class, resource = %id, reason = %reason, "Skipping resource");
        self.skipped.push(SkippedResource {
            resource: ResourceRef::new(class, id),
            reason,
        });
    }

    fn fail(&mut self, class: ResourceClass, id: &str, error: Error) {
        warn!(class = %class, resource = %id, error = %error, "Failed to delete resource");
        let error = match error {
            e @ (Error::ResourceDeletion { .. } | Error::DependencyViolation { .. }) => e,
            other => Error::deletion(class, id, other.to_string()),
        };
        self.errors.push(error);
    }
}

/// Deletes tracked resources in dependency order
pub struct TeardownOrchestrator<'a> {
    backend: &'a dyn Backend,
    config: &'a OrchestratorConfig,
    cancel: &'a CancellationToken,
}

impl<'a> TeardownOrchestrator<'a> {
    /// Orchestrator over a backend
    ///
    /// Cancellation only shortens the waits; every delete is still attempted.
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

    /// Delete everything the tracker recorded
    #[instrument(skip_all, fields(cluster = %tracker.cluster, resources = tracker.len()))]
    pub async fn teardown(&self, tracker: &ResourceTracker) -> TeardownReport {
        let mut report = TeardownReport::default();
        info!(cluster = %tracker.cluster, resources = tracker.len(), "Starting teardown");

        self.delete_load_balancers(tracker, &mut report).await;
        self.delete_compute_nodes(tracker, &mut report).await;
        self.delete_volumes(tracker, &mut report).await;
        self.release_addresses(tracker, &mut report).await;
        self.delete_nat_gateways(tracker, &mut report).await;
        self.delete_interfaces(tracker, &mut report).await;
        self.delete_security_boundaries(tracker, &mut report).await;
        self.delete_route_tables(tracker, &mut report).await;
        self.delete_subnets(tracker, &mut report).await;
        self.delete_internet_gateways(tracker, &mut report).await;
        self.delete_networks(tracker, &mut report).await;

        if report.is_clean() {
            info!(
                cluster = %tracker.cluster,
                deleted = report.deleted.len(),
                skipped = report.skipped.len(),
                "Teardown complete"
            );
        } else {
            warn!(
                cluster = %tracker.cluster,
                deleted = report.deleted.len(),
                errors = report.errors.len(),
                "Teardown finished with errors"
            );
        }
        report
    }

    /// Run one delete, optionally retrying dependency violations.
    /// `NotFound` counts as deleted.
    async fn delete_one<F, Fut>(
        &self,
        report: &mut TeardownReport,
        class: ResourceClass,
        id: &str,
        retry: bool,
        delete: F,
    ) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let result = if retry {
            let operation = format!("delete {} {}", class, id);
            with_retry(
                &self.config.deletion_retry,
                &operation,
                Error::is_dependency_violation,
                &delete,
            )
            .await
        } else {
            delete().await
        };

        match result {
            Ok(()) => {
                debug!(class = %class, resource = %id, "Deleted resource");
                report.deleted.push(ResourceRef::new(class, id));
                true
            }
            Err(e) if e.is_not_found() => {
                debug!(class = %class, resource = %id, "Resource already gone");
                report.deleted.push(ResourceRef::new(class, id));
                true
            }
            Err(e) => {
                report.fail(class, id, e);
                false
            }
        }
    }

    async fn delete_load_balancers(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::LoadBalancer) {
            match self.backend.describe_load_balancer(id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    report
                        .deleted
                        .push(ResourceRef::new(ResourceClass::LoadBalancer, id));
                    continue;
                }
                Err(e) => {
                    report.fail(ResourceClass::LoadBalancer, id, e);
                    continue;
                }
            }
            self.delete_one(report, ResourceClass::LoadBalancer, id, false, || {
                self.backend.delete_load_balancer(id)
            })
            .await;
        }
    }

    /// Terminate nodes, then wait (bounded) for them to finish terminating.
    /// Running past the wait is logged, not an error.
    async fn delete_compute_nodes(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        let mut terminating = Vec::new();
        for id in tracker.ids(ResourceClass::ComputeNode) {
            if self
                .delete_one(report, ResourceClass::ComputeNode, id, false, || {
                    self.backend.terminate_node(id)
                })
                .await
            {
                terminating.push(id.clone());
            }
        }
        if terminating.is_empty() {
            return;
        }

        info!(nodes = terminating.len(), "Waiting for nodes to terminate");
        let waited = poll_until(
            &self.config.node_termination,
            "node termination",
            self.cancel,
            || async {
                for id in &terminating {
                    match self.backend.describe_node(id).await? {
                        None => {}
                        Some(state) if state.phase == NodePhase::Terminated => {}
                        Some(_) => return Ok(None),
                    }
                }
                Ok(Some(()))
            },
        )
        .await;

        if let Err(e) = waited {
            warn!(error = %e, "Nodes did not finish terminating, continuing teardown");
        }
    }

    /// Delete volumes once compute is gone. A volume still attached to a node
    /// this cluster does not own is left alone; one attached to a terminating
    /// node is retried until it detaches.
    async fn delete_volumes(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::Volume) {
            let info = match self.backend.describe_volume(id).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    report.deleted.push(ResourceRef::new(ResourceClass::Volume, id));
                    continue;
                }
                Err(e) => {
                    report.fail(ResourceClass::Volume, id, e);
                    continue;
                }
            };

            if let Some(ref node) = info.attached_to {
                if !tracker.contains(ResourceClass::ComputeNode, node) {
                    report.skip(
                        ResourceClass::Volume,
                        id,
                        format!("attached to untracked node {}", node),
                    );
                    continue;
                }
            }

            self.delete_one(report, ResourceClass::Volume, id, true, || {
                self.backend.delete_volume(id)
            })
            .await;
        }
    }

    /// Release addresses bound to nothing, or to something this cluster owns
    async fn release_addresses(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::Address) {
            let info = match self.backend.describe_address(id).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    report.deleted.push(ResourceRef::new(ResourceClass::Address, id));
                    continue;
                }
                Err(e) => {
                    report.fail(ResourceClass::Address, id, e);
                    continue;
                }
            };

            if let Some(ref bound) = info.associated_with {
                let owned = tracker.contains(ResourceClass::ComputeNode, bound)
                    || tracker.contains(ResourceClass::NetworkInterface, bound);
                if !owned {
                    report.skip(
                        ResourceClass::Address,
                        id,
                        format!("bound to untracked resource {}", bound),
                    );
                    continue;
                }
                if let Err(e) = self.backend.disassociate_address(id).await {
                    if !e.is_not_found() {
                        report.fail(ResourceClass::Address, id, e);
                        continue;
                    }
                }
            }

            self.delete_one(report, ResourceClass::Address, id, true, || {
                self.backend.release_address(id)
            })
            .await;
        }
    }

    async fn delete_nat_gateways(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::NatGateway) {
            self.delete_one(report, ResourceClass::NatGateway, id, false, || {
                self.backend.delete_nat_gateway(id)
            })
            .await;
        }
    }

    /// Delete interfaces not attached to a live node
    async fn delete_interfaces(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::NetworkInterface) {
            let info = match self.backend.describe_interface(id).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    report
                        .deleted
                        .push(ResourceRef::new(ResourceClass::NetworkInterface, id));
                    continue;
                }
                Err(e) => {
                    report.fail(ResourceClass::NetworkInterface, id, e);
                    continue;
                }
            };

            if let Some(ref node) = info.attached_to {
                let live = match self.backend.describe_node(node).await {
                    Ok(Some(state)) => state.phase != NodePhase::Terminated,
                    Ok(None) => false,
                    Err(_) => true,
                };
                if live {
                    report.skip(
                        ResourceClass::NetworkInterface,
                        id,
                        format!("attached to live node {}", node),
                    );
                    continue;
                }
            }

            self.delete_one(report, ResourceClass::NetworkInterface, id, true, || {
                self.backend.delete_interface(id)
            })
            .await;
        }
    }

    /// Strip rules from every boundary first so boundaries referencing each
    /// other can be deleted, then delete with retry
    async fn delete_security_boundaries(
        &self,
        tracker: &ResourceTracker,
        report: &mut TeardownReport,
    ) {
        let mut targets = Vec::new();
        for id in tracker.ids(ResourceClass::SecurityBoundary) {
            match self.backend.describe_security_boundary(id).await {
                Ok(Some(info)) if info.is_default => {
                    report.skip(ResourceClass::SecurityBoundary, id, "default security boundary");
                }
                Ok(Some(info)) => targets.push((id.clone(), info.rule_count)),
                Ok(None) => report
                    .deleted
                    .push(ResourceRef::new(ResourceClass::SecurityBoundary, id)),
                Err(e) => {
                    // Still attempt the delete below; describe may be flaky
                    warn!(resource = %id, error = %e, "Failed to describe security boundary");
                    targets.push((id.clone(), usize::MAX));
                }
            }
        }
        if targets.is_empty() {
            return;
        }

        let mut revoked = false;
        for (id, rule_count) in &targets {
            if *rule_count == 0 {
                continue;
            }
            match self.backend.revoke_all_rules(id).await {
                Ok(()) => revoked = true,
                Err(e) => warn!(resource = %id, error = %e, "Failed to revoke security rules"),
            }
        }

        if revoked && self.config.security_rule_propagation > Duration::ZERO {
            debug!(
                delay_secs = self.config.security_rule_propagation.as_secs(),
                "Waiting for rule revocation to propagate"
            );
            // A cancelled wait just moves on to the deletes
            let _ = sleep_or_cancel(
                self.config.security_rule_propagation,
                "security rule propagation",
                self.cancel,
            )
            .await;
        }

        for (id, _) in &targets {
            self.delete_one(report, ResourceClass::SecurityBoundary, id, true, || {
                self.backend.delete_security_boundary(id)
            })
            .await;
        }
    }

    /// Delete routing tables except the network's main table
    async fn delete_route_tables(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::RouteTable) {
            match self.backend.describe_route_table(id).await {
                Ok(Some(info)) if info.is_main => {
                    report.skip(ResourceClass::RouteTable, id, "main routing table");
                    continue;
                }
                Ok(None) => {
                    report.deleted.push(ResourceRef::new(ResourceClass::RouteTable, id));
                    continue;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    report.fail(ResourceClass::RouteTable, id, e);
                    continue;
                }
            }
            self.delete_one(report, ResourceClass::RouteTable, id, true, || {
                self.backend.delete_route_table(id)
            })
            .await;
        }
    }

    async fn delete_subnets(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::Subnet) {
            self.delete_one(report, ResourceClass::Subnet, id, true, || {
                self.backend.delete_subnet(id)
            })
            .await;
        }
    }

    async fn delete_internet_gateways(
        &self,
        tracker: &ResourceTracker,
        report: &mut TeardownReport,
    ) {
        let network = tracker.ids(ResourceClass::Network).first();
        for id in tracker.ids(ResourceClass::InternetGateway) {
            if let Some(network_id) = network {
                if let Err(e) = self.backend.detach_internet_gateway(id, network_id).await {
                    if !e.is_not_found() {
                        warn!(resource = %id, error = %e, "Failed to detach internet gateway");
                    }
                }
            }
            self.delete_one(report, ResourceClass::InternetGateway, id, true, || {
                self.backend.delete_internet_gateway(id)
            })
            .await;
        }
    }

    async fn delete_networks(&self, tracker: &ResourceTracker, report: &mut TeardownReport) {
        for id in tracker.ids(ResourceClass::Network) {
            self.delete_one(report, ResourceClass::Network, id, true, || {
                self.backend.delete_network(id)
            })
            .await;
        }
    }
}
