//! Common types for kubeforge: cluster model, errors, retry primitives and configuration

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod retry;
pub mod telemetry;
pub mod types;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the Kubernetes API server listens on for every provisioned cluster
pub const API_SERVER_PORT: u16 = 6443;

/// Tag key marking a resource as created by kubeforge
pub const MANAGED_BY_TAG: &str = "kubeforge.io/managed-by";

/// Value stored under [`MANAGED_BY_TAG`]
pub const MANAGED_BY_VALUE: &str = "kubeforge";

/// Tag key holding the owning cluster's name
pub const CLUSTER_TAG: &str = "kubeforge.io/cluster";

/// Tag key holding a node's role (`control-plane` or `worker`)
pub const ROLE_TAG: &str = "kubeforge.io/role";

/// Tag key holding a worker node's node-group name
pub const NODE_GROUP_TAG: &str = "kubeforge.io/node-group";

/// Prefix of the legacy single-tag ownership convention (`kubernetes.io/cluster/<name>`)
pub const LEGACY_CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Value stored under the legacy ownership tag
pub const LEGACY_CLUSTER_TAG_VALUE: &str = "owned";

/// Legacy ownership tag key for a cluster
pub fn legacy_cluster_tag(cluster_name: &str) -> String {
    format!("{}{}", LEGACY_CLUSTER_TAG_PREFIX, cluster_name)
}
