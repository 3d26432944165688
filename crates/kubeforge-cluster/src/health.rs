//! Cluster health and node metrics, read through `kubectl` on the primary node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use kubeforge_common::config::OrchestratorConfig;
use kubeforge_common::retry::poll_until;
use kubeforge_common::types::NodeInfo;
use kubeforge_common::{Error, Result};

use crate::backend::Backend;
use crate::bootstrap::{commands, RemoteShell};

/// Readiness of one Kubernetes node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    /// Kubernetes node name
    pub name: String,
    /// `Ready` condition is true
    pub ready: bool,
    /// Raw status column (`Ready`, `NotReady`, `Ready,SchedulingDisabled`)
    pub status: String,
    /// Kubelet version
    pub version: String,
}

/// Snapshot of node readiness
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Every node the API server knows about
    pub nodes: Vec<NodeHealth>,
    /// When the snapshot was taken
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Number of registered nodes
    pub fn total(&self) -> usize {
        self.nodes.len()
    }

    /// Number of ready nodes
    pub fn ready(&self) -> usize {
        self.nodes.iter().filter(|n| n.ready).count()
    }

    /// Names of nodes that are not ready
    pub fn not_ready(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !n.ready)
            .map(|n| n.name.as_str())
            .collect()
    }

    /// At least `expected` nodes registered and all of them ready
    pub fn is_healthy(&self, expected: usize) -> bool {
        self.total() >= expected && self.ready() == self.total()
    }
}

/// Parse `kubectl get nodes --no-headers`
///
/// Columns: NAME STATUS ROLES AGE VERSION.
pub fn parse_node_list(output: &str) -> Result<HealthReport> {
    let mut nodes = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 2 {
            return Err(Error::serialization(format!(
                "unexpected node list line: {}",
                line
            )));
        }
        let status = cols[1];
        nodes.push(NodeHealth {
            name: cols[0].to_string(),
            ready: status.split(',').any(|s| s == "Ready"),
            status: status.to_string(),
            version: cols.last().map(|v| v.to_string()).unwrap_or_default(),
        });
    }
    Ok(HealthReport {
        nodes,
        checked_at: Utc::now(),
    })
}

/// Resource usage of one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    /// Kubernetes node name
    pub name: String,
    /// CPU in millicores
    pub cpu_millicores: u64,
    /// CPU as a percentage of allocatable
    pub cpu_percent: u32,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Memory as a percentage of allocatable
    pub memory_percent: u32,
}

/// Usage across the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMetrics {
    /// Registered nodes
    pub total_nodes: usize,
    /// Ready nodes
    pub ready_nodes: usize,
    /// Per-node usage, for nodes metrics-server has reported on
    pub nodes: Vec<NodeMetrics>,
    /// When the metrics were read
    pub collected_at: DateTime<Utc>,
}

impl ClusterMetrics {
    /// Summed CPU usage
    pub fn cpu_millicores(&self) -> u64 {
        self.nodes.iter().map(|n| n.cpu_millicores).sum()
    }

    /// Summed memory usage
    pub fn memory_mib(&self) -> u64 {
        self.nodes.iter().map(|n| n.memory_mib).sum()
    }
}

/// Parse `kubectl top nodes --no-headers`
///
/// Columns: NAME CPU(cores) CPU% MEMORY(bytes) MEMORY%. Nodes metrics-server
/// has no data for (`<unknown>`) are left out.
pub fn parse_top_nodes(output: &str) -> Result<Vec<NodeMetrics>> {
    let mut metrics = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.contains("<unknown>") {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [name, cpu, cpu_pct, mem, mem_pct] = cols[..] else {
            return Err(Error::serialization(format!(
                "unexpected top nodes line: {}",
                line
            )));
        };
        let bad = || Error::serialization(format!("unparseable top nodes line: {}", line));
        metrics.push(NodeMetrics {
            name: name.to_string(),
            cpu_millicores: parse_cpu(cpu).ok_or_else(bad)?,
            cpu_percent: parse_percent(cpu_pct).ok_or_else(bad)?,
            memory_mib: parse_memory_mib(mem).ok_or_else(bad)?,
            memory_percent: parse_percent(mem_pct).ok_or_else(bad)?,
        });
    }
    Ok(metrics)
}

fn parse_cpu(s: &str) -> Option<u64> {
    match s.strip_suffix('m') {
        Some(milli) => milli.parse().ok(),
        None => s.parse::<u64>().ok().map(|cores| cores * 1000),
    }
}

fn parse_percent(s: &str) -> Option<u32> {
    s.strip_suffix('%')?.parse().ok()
}

fn parse_memory_mib(s: &str) -> Option<u64> {
    if let Some(v) = s.strip_suffix("Ki") {
        return v.parse::<u64>().ok().map(|k| k / 1024);
    }
    if let Some(v) = s.strip_suffix("Mi") {
        return v.parse().ok();
    }
    if let Some(v) = s.strip_suffix("Gi") {
        return v.parse::<u64>().ok().map(|g| g * 1024);
    }
    s.parse::<u64>().ok().map(|b| b / (1024 * 1024))
}

/// Reads health and metrics from a cluster's primary node
pub struct HealthChecker<'a> {
    backend: &'a dyn Backend,
    config: &'a OrchestratorConfig,
    cancel: &'a CancellationToken,
}

impl<'a> HealthChecker<'a> {
    /// Checker over a backend
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

    /// One readiness snapshot
    pub async fn check(&self, primary: &NodeInfo) -> Result<HealthReport> {
        let output = RemoteShell::new(self.backend)
            .run(primary, &commands::get_nodes())
            .await?;
        parse_node_list(&output.stdout)
    }

    /// Poll until `expected` nodes are registered and ready
    ///
    /// Failing `kubectl` calls count as "not yet": the API server may still be
    /// settling after the last join.
    #[instrument(skip(self, primary), fields(node = %primary.name))]
    pub async fn wait_healthy(&self, primary: &NodeInfo, expected: usize) -> Result<HealthReport> {
        let report = poll_until(
            &self.config.health_check,
            "cluster health",
            self.cancel,
            || async {
                match self.check(primary).await {
                    Ok(report) if report.is_healthy(expected) => Ok(Some(report)),
                    Ok(report) => {
                        debug!(
                            ready = report.ready(),
                            total = report.total(),
                            expected = expected,
                            "Waiting for nodes to become ready"
                        );
                        Ok(None)
                    }
                    Err(e @ Error::RemoteCommand { .. }) => {
                        debug!(error = %e, "Node list not available yet");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        info!(ready = report.ready(), "All nodes ready");
        Ok(report)
    }

    /// Node counts plus per-node usage from metrics-server
    pub async fn metrics(&self, primary: &NodeInfo) -> Result<ClusterMetrics> {
        let health = self.check(primary).await?;
        let output = RemoteShell::new(self.backend)
            .run(primary, &commands::top_nodes())
            .await?;
        Ok(ClusterMetrics {
            total_nodes: health.total(),
            ready_nodes: health.ready(),
            nodes: parse_top_nodes(&output.stdout)?,
            collected_at: Utc::now(),
        })
    }
}
