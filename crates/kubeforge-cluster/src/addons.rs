//! Cluster addons
//!
//! A fixed catalog of manifests applied with `kubectl` on the primary node.
//! Installed addons are recorded in cluster metadata as `addon.<name>=<version>`.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use kubeforge_common::types::{Cluster, NodeInfo};
use kubeforge_common::{Error, Result};

use crate::backend::Backend;
use crate::bootstrap::{commands, RemoteShell};

const METADATA_PREFIX: &str = "addon.";

/// Addons kubeforge knows how to install
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Addon {
    /// ingress-nginx controller
    IngressNginx,
    /// cert-manager
    CertManager,
    /// metrics-server, needed for node metrics
    MetricsServer,
}

impl Addon {
    /// Whole catalog
    pub const ALL: [Addon; 3] = [Addon::IngressNginx, Addon::CertManager, Addon::MetricsServer];

    /// Catalog name
    pub fn name(&self) -> &'static str {
        match self {
            Self::IngressNginx => "ingress-nginx",
            Self::CertManager => "cert-manager",
            Self::MetricsServer => "metrics-server",
        }
    }

    /// Pinned version
    pub fn version(&self) -> &'static str {
        match self {
            Self::IngressNginx => "1.11.2",
            Self::CertManager => "1.15.3",
            Self::MetricsServer => "0.7.2",
        }
    }

    /// One-line description
    pub fn description(&self) -> &'static str {
        match self {
            Self::IngressNginx => "Ingress controller backed by NGINX",
            Self::CertManager => "X.509 certificate management",
            Self::MetricsServer => "Resource metrics API for nodes and pods",
        }
    }

    /// Manifest applied to install the addon
    pub fn manifest_url(&self) -> String {
        match self {
            Self::IngressNginx => format!(
                "https://raw.githubusercontent.com/kubernetes/ingress-nginx/controller-v{}/deploy/static/provider/cloud/deploy.yaml",
                self.version()
            ),
            Self::CertManager => format!(
                "https://github.com/cert-manager/cert-manager/releases/download/v{}/cert-manager.yaml",
                self.version()
            ),
            Self::MetricsServer => format!(
                "https://github.com/kubernetes-sigs/metrics-server/releases/download/v{}/components.yaml",
                self.version()
            ),
        }
    }

    fn metadata_key(&self) -> String {
        format!("{}{}", METADATA_PREFIX, self.name())
    }
}

impl fmt::Display for Addon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Addon {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(Addon::name).collect();
                Error::validation(format!(
                    "unknown addon '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// Catalog entry as seen on one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    /// The addon
    pub addon: Addon,
    /// Catalog version
    pub version: String,
    /// Installed version, if installed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
}

/// Every catalog addon with its install state on `cluster`
pub fn list_addons(cluster: &Cluster) -> Vec<AddonStatus> {
    Addon::ALL
        .iter()
        .map(|addon| AddonStatus {
            addon: *addon,
            version: addon.version().to_string(),
            installed_version: cluster.metadata.get(&addon.metadata_key()).cloned(),
        })
        .collect()
}

/// Whether `addon` is recorded as installed
pub fn is_installed(cluster: &Cluster, addon: Addon) -> bool {
    cluster.metadata.contains_key(&addon.metadata_key())
}

/// Record an installed addon
pub fn mark_installed(cluster: &mut Cluster, addon: Addon) {
    cluster.set_metadata(addon.metadata_key(), addon.version());
}

/// Forget an uninstalled addon
pub fn mark_removed(cluster: &mut Cluster, addon: Addon) {
    if cluster.metadata.remove(&addon.metadata_key()).is_some() {
        cluster.updated_at = Utc::now();
    }
}

/// Applies and removes addon manifests through the primary node
pub struct AddonInstaller<'a> {
    backend: &'a dyn Backend,
}

impl<'a> AddonInstaller<'a> {
    /// Installer over a backend
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Apply the addon's manifest
    pub async fn install(&self, primary: &NodeInfo, addon: Addon) -> Result<()> {
        RemoteShell::new(self.backend)
            .run(primary, &commands::apply_manifest(&addon.manifest_url()))
            .await?;
        info!(addon = %addon, version = addon.version(), "Installed addon");
        Ok(())
    }

    /// Delete the objects of the addon's manifest
    pub async fn uninstall(&self, primary: &NodeInfo, addon: Addon) -> Result<()> {
        RemoteShell::new(self.backend)
            .run(primary, &commands::delete_manifest(&addon.manifest_url()))
            .await?;
        info!(addon = %addon, "Uninstalled addon");
        Ok(())
    }
}
