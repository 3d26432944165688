//! Cluster orchestration core for kubeforge
//!
//! This crate turns a `ClusterSpec` into a running Kubernetes cluster on any
//! infrastructure backend that implements [`Backend`], and takes it apart
//! again in dependency order.
//!
//! - `provision`: the step pipeline with rollback on failure
//! - `bootstrap`: per-node readiness, init and join state machine
//! - `tracker` / `discovery`: what belongs to a cluster
//! - `teardown`: ordered, retrying, best-effort deletion
//! - `service`: the lifecycle surface (create, delete, update, backup, ...)

pub mod addons;
pub mod backend;
pub mod backup;
pub mod bootstrap;
pub mod discovery;
pub mod health;
pub mod provision;
pub mod registry;
pub mod scale;
pub mod service;
pub mod teardown;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::Backend;
pub use provision::{ProvisionFailure, Provisioned, ProvisioningPipeline};
pub use registry::{ClusterRegistry, OperationHandle};
pub use service::{ClusterManager, ManagerOptions};
pub use teardown::{TeardownOrchestrator, TeardownReport};
pub use tracker::{ResourceTracker, TrackerStore};

// Re-export common error types
pub use kubeforge_common::{Error, Result};
