//! Client-access kubeconfig emitted after provisioning
//!
//! A kubeconfig starts out with placeholder (empty) credentials pointing at the
//! external API endpoint. When the primary node's `admin.conf` can be fetched,
//! its CA and client credentials are copied in while the server stays the
//! external endpoint. A kubeconfig whose credentials are still empty needs
//! manual authentication.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kubeconfig document with the fields kubeforge reads and writes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kubeconfig {
    /// Always `v1`
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Always `Config`
    pub kind: String,
    /// Named clusters
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    /// Named users
    #[serde(default)]
    pub users: Vec<NamedUser>,
    /// Named contexts
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    /// Context selected by default
    #[serde(rename = "current-context", default)]
    pub current_context: String,
}

/// Cluster entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Connection settings
    pub cluster: ClusterEntry,
}

/// Cluster connection settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// Base64 PEM of the cluster CA
    #[serde(
        rename = "certificate-authority-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub certificate_authority_data: Option<String>,
    /// Skip TLS verification (only set while no CA is known)
    #[serde(
        rename = "insecure-skip-tls-verify",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub insecure_skip_tls_verify: bool,
}

/// User entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// Credentials
    pub user: UserEntry,
}

/// User credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Base64 PEM client certificate
    #[serde(
        rename = "client-certificate-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_data: Option<String>,
    /// Base64 PEM client key
    #[serde(
        rename = "client-key-data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_key_data: Option<String>,
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("has_client_certificate", &self.client_certificate_data.is_some())
            .field("has_client_key", &self.client_key_data.is_some())
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

impl UserEntry {
    fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map(str::is_empty).unwrap_or(true);
        blank(&self.token) && (blank(&self.client_certificate_data) || blank(&self.client_key_data))
    }
}

/// Context entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Cluster and user the context binds
    pub context: ContextEntry,
}

/// Cluster/user binding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

impl Kubeconfig {
    /// Kubeconfig with placeholder credentials for a cluster endpoint
    pub fn for_cluster(cluster_name: &str, endpoint: &str) -> Self {
        let user_name = admin_user(cluster_name);
        let context_name = context_name(cluster_name);
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: ClusterEntry {
                    server: endpoint.to_string(),
                    certificate_authority_data: None,
                    insecure_skip_tls_verify: true,
                },
            }],
            users: vec![NamedUser {
                name: user_name.clone(),
                user: UserEntry::default(),
            }],
            contexts: vec![NamedContext {
                name: context_name.clone(),
                context: ContextEntry {
                    cluster: cluster_name.to_string(),
                    user: user_name,
                },
            }],
            current_context: context_name,
        }
    }

    /// Build a kubeconfig from a node's `admin.conf`, pointed at `endpoint`
    ///
    /// The first cluster and user in the document supply the CA and client
    /// credentials; everything is renamed after `cluster_name`.
    pub fn from_admin_conf(admin_conf: &str, cluster_name: &str, endpoint: &str) -> Result<Self> {
        let source: Kubeconfig = serde_yaml::from_str(admin_conf)?;

        let ca = source
            .clusters
            .first()
            .and_then(|c| c.cluster.certificate_authority_data.clone())
            .ok_or_else(|| Error::serialization("admin.conf has no cluster CA data"))?;
        STANDARD
            .decode(ca.trim())
            .map_err(|e| Error::serialization(format!("admin.conf CA is not base64: {}", e)))?;

        let user = source
            .users
            .first()
            .map(|u| u.user.clone())
            .ok_or_else(|| Error::serialization("admin.conf has no user entry"))?;

        let mut config = Self::for_cluster(cluster_name, endpoint);
        if let Some(entry) = config.clusters.first_mut() {
            entry.cluster.certificate_authority_data = Some(ca);
            entry.cluster.insecure_skip_tls_verify = false;
        }
        if let Some(entry) = config.users.first_mut() {
            entry.user = user;
        }
        Ok(config)
    }

    /// API server URL of the current context's cluster
    pub fn server(&self) -> Option<&str> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)?;
        self.clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| c.cluster.server.as_str())
    }

    /// Whether the credentials are still placeholders
    pub fn needs_manual_auth(&self) -> bool {
        self.users.iter().all(|u| u.user.is_empty())
    }

    /// Decoded PEM of the cluster CA, if present
    pub fn ca_certificate_pem(&self) -> Option<String> {
        let data = self.clusters.first()?.cluster.certificate_authority_data.as_ref()?;
        let bytes = STANDARD.decode(data.trim()).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn admin_user(cluster_name: &str) -> String {
    format!("{}-admin", cluster_name)
}

fn context_name(cluster_name: &str) -> String {
    format!("{}-admin@{}", cluster_name, cluster_name)
}
