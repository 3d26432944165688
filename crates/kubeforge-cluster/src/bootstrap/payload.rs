//! Bootstrap payload injected into new nodes
//!
//! The payload installs containerd and the kubeadm toolchain for the requested
//! Kubernetes minor version, then leaves the completion marker the bootstrap
//! state machine polls for. Joining and control-plane initialization happen
//! afterwards over remote execution.

use base64::{engine::general_purpose::STANDARD, Engine};

use kubeforge_common::types::{parse_version, NodeRole};
use kubeforge_common::{Error, Result};

use super::commands::BOOTSTRAP_MARKER;

/// Startup script for one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPayload {
    node_name: String,
    role: NodeRole,
    minor_version: String,
    full_version: String,
}

impl BootstrapPayload {
    /// Payload for a node running the given Kubernetes version
    pub fn new(node_name: &str, role: NodeRole, kubernetes_version: &str) -> Result<Self> {
        let (major, minor, patch) = parse_version(kubernetes_version).ok_or_else(|| {
            Error::validation(format!(
                "invalid Kubernetes version '{}'",
                kubernetes_version
            ))
        })?;
        Ok(Self {
            node_name: node_name.to_string(),
            role,
            minor_version: format!("{}.{}", major, minor),
            full_version: format!("{}.{}.{}", major, minor, patch),
        })
    }

    /// Rendered shell script
    pub fn render(&self) -> String {
        format!(
            r#"#!/bin/bash
set -euxo pipefail

hostnamectl set-hostname {node_name}
echo "kubeforge role: {role}"

swapoff -a
sed -i '/ swap / s/^/#/' /etc/fstab

cat > /etc/modules-load.d/k8s.conf << 'EOF'
overlay
br_netfilter
EOF
modprobe overlay
modprobe br_netfilter

cat > /etc/sysctl.d/k8s.conf << 'EOF'
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sysctl --system

apt-get update
apt-get install -y apt-transport-https ca-certificates curl gpg containerd

mkdir -p /etc/containerd
containerd config default > /etc/containerd/config.toml
sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
systemctl restart containerd
systemctl enable containerd

mkdir -p /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{minor}/deb/Release.key \
  | gpg --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{minor}/deb/ /' \
  > /etc/apt/sources.list.d/kubernetes.list

apt-get update
apt-get install -y kubelet={full}-* kubeadm={full}-* kubectl={full}-*
apt-mark hold kubelet kubeadm kubectl
systemctl enable kubelet

mkdir -p "$(dirname {marker})"
touch {marker}
"#,
            node_name = self.node_name,
            role = self.role,
            minor = self.minor_version,
            full = self.full_version,
            marker = BOOTSTRAP_MARKER,
        )
    }

    /// Script encoded as base64 user data
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.render())
    }
}
