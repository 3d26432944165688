//! Shell commands run on cluster nodes
//!
//! Everything that runs kubeadm/kubectl on a node is built here so the exact
//! command lines can be asserted in tests.

use kubeforge_common::types::{Cni, JoinCredentials};
use kubeforge_common::API_SERVER_PORT;

/// File the bootstrap payload writes once the node-local stack is installed
pub const BOOTSTRAP_MARKER: &str = "/var/lib/kubeforge/bootstrap-complete";

/// Admin kubeconfig kubeadm writes on control-plane nodes
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// Where etcd snapshots are written on the primary node
pub const SNAPSHOT_DIR: &str = "/var/lib/kubeforge/snapshots";

fn kubectl(args: &str) -> String {
    format!("sudo kubectl --kubeconfig={} {}", ADMIN_CONF, args)
}

/// Succeeds once the bootstrap payload has finished
pub fn check_bootstrap_marker() -> String {
    format!("test -f {}", BOOTSTRAP_MARKER)
}

/// Initialize the control plane on the primary node
///
/// `upload_certs` shares control-plane certificates through the cluster so
/// additional control-plane nodes can join.
pub fn kubeadm_init(
    endpoint_host: &str,
    advertise_address: &str,
    kubernetes_version: &str,
    cni: Cni,
    upload_certs: bool,
) -> String {
    let mut cmd = format!(
        "sudo kubeadm init --control-plane-endpoint {}:{} --apiserver-advertise-address {} \
         --apiserver-cert-extra-sans {} --pod-network-cidr {} --kubernetes-version v{}",
        endpoint_host,
        API_SERVER_PORT,
        advertise_address,
        endpoint_host,
        cni.pod_cidr(),
        kubernetes_version.trim_start_matches('v'),
    );
    if upload_certs {
        cmd.push_str(" --upload-certs");
    }
    cmd
}

/// Print a fresh worker join command
pub fn print_join_command() -> String {
    "sudo kubeadm token create --print-join-command".to_string()
}

/// Re-upload control-plane certificates and print the decryption key
pub fn upload_certs() -> String {
    "sudo kubeadm init phase upload-certs --upload-certs".to_string()
}

/// Join a node to the cluster
///
/// Control-plane joins need the certificate key; without one the node joins
/// as a worker.
pub fn kubeadm_join(credentials: &JoinCredentials, control_plane: bool) -> String {
    let mut cmd = format!(
        "sudo kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
        credentials.endpoint, credentials.token, credentials.ca_cert_hash
    );
    if control_plane {
        if let Some(ref key) = credentials.certificate_key {
            cmd.push_str(&format!(" --control-plane --certificate-key {}", key));
        }
    }
    cmd
}

/// Apply a manifest by URL
pub fn apply_manifest(url: &str) -> String {
    kubectl(&format!("apply -f {}", url))
}

/// Delete the objects of a manifest by URL
pub fn delete_manifest(url: &str) -> String {
    kubectl(&format!("delete --ignore-not-found -f {}", url))
}

/// Print the admin kubeconfig
pub fn read_admin_conf() -> String {
    format!("sudo cat {}", ADMIN_CONF)
}

/// List nodes and their readiness
pub fn get_nodes() -> String {
    kubectl("get nodes --no-headers")
}

/// Per-node resource usage (needs metrics-server)
pub fn top_nodes() -> String {
    kubectl("top nodes --no-headers")
}

/// Evict workloads from a node before removing it
pub fn drain_node(node_name: &str) -> String {
    kubectl(&format!(
        "drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout=300s",
        node_name
    ))
}

/// Remove a node object from the cluster
pub fn delete_node(node_name: &str) -> String {
    kubectl(&format!("delete node {} --ignore-not-found", node_name))
}

/// Write an etcd snapshot to `path`
pub fn etcd_snapshot(path: &str) -> String {
    format!(
        "sudo mkdir -p {dir} && sudo ETCDCTL_API=3 etcdctl \
         --endpoints=https://127.0.0.1:2379 \
         --cacert=/etc/kubernetes/pki/etcd/ca.crt \
         --cert=/etc/kubernetes/pki/etcd/server.crt \
         --key=/etc/kubernetes/pki/etcd/server.key \
         snapshot save {path}",
        dir = SNAPSHOT_DIR,
        path = path
    )
}

/// Restore etcd from a snapshot and restart the static pods
pub fn etcd_restore(path: &str) -> String {
    format!(
        "sudo mv /etc/kubernetes/manifests /etc/kubernetes/manifests.restore && \
         sudo rm -rf /var/lib/etcd.restore && \
         sudo ETCDCTL_API=3 etcdutl snapshot restore {path} --data-dir /var/lib/etcd.restore && \
         sudo rm -rf /var/lib/etcd && sudo mv /var/lib/etcd.restore /var/lib/etcd && \
         sudo mv /etc/kubernetes/manifests.restore /etc/kubernetes/manifests",
        path = path
    )
}
