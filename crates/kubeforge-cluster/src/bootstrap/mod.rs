//! Node bootstrap state machine
//!
//! Each node moves `Provisioned -> InfrastructureReady -> BootstrapComplete ->
//! RoleReady`. The first two transitions are detected by polling: the backend
//! assigning an address, then the bootstrap payload's completion marker. The
//! last one is the role-specific step: control-plane initialization on the
//! primary, `kubeadm join` everywhere else. Joins are attempted once.

pub mod commands;
pub mod join;
pub mod payload;
pub mod remote;

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use kubeforge_common::config::OrchestratorConfig;
use kubeforge_common::retry::poll_until;
use kubeforge_common::types::{Cni, JoinCredentials, NodeInfo, ResourceClass};
use kubeforge_common::{Error, Result};

use crate::backend::{Backend, NodePhase};

pub use join::{parse_certificate_key, parse_join_command};
pub use payload::BootstrapPayload;
pub use remote::RemoteShell;

/// Bootstrap progress of one node
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    /// Created by the backend
    Provisioned,
    /// Has an address
    InfrastructureReady,
    /// Bootstrap payload finished
    BootstrapComplete,
    /// Initialized or joined
    RoleReady,
}

impl BootstrapState {
    /// The only state this one may move to
    pub fn next(&self) -> Option<BootstrapState> {
        match self {
            Self::Provisioned => Some(Self::InfrastructureReady),
            Self::InfrastructureReady => Some(Self::BootstrapComplete),
            Self::BootstrapComplete => Some(Self::RoleReady),
            Self::RoleReady => None,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioned => write!(f, "Provisioned"),
            Self::InfrastructureReady => write!(f, "InfrastructureReady"),
            Self::BootstrapComplete => write!(f, "BootstrapComplete"),
            Self::RoleReady => write!(f, "RoleReady"),
        }
    }
}

/// How a node reaches `RoleReady`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapRole {
    /// First control-plane node; runs `kubeadm init`
    Primary,
    /// Additional control-plane node
    JoinControlPlane,
    /// Worker node
    Worker,
}

/// A node and where it is in the bootstrap sequence
#[derive(Clone, Debug)]
pub struct NodeBootstrap {
    /// The node; addresses and credential are filled in as it progresses
    pub node: NodeInfo,
    /// Bootstrap role
    pub role: BootstrapRole,
    state: BootstrapState,
}

impl NodeBootstrap {
    /// Track a freshly created node
    pub fn new(node: NodeInfo, role: BootstrapRole) -> Self {
        Self {
            node,
            role,
            state: BootstrapState::Provisioned,
        }
    }

    /// Current state
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    fn expect(&self, state: BootstrapState) -> Result<()> {
        if self.state != state {
            return Err(Error::internal_with_context(
                "bootstrap",
                format!(
                    "node {} is {}, expected {}",
                    self.node.name, self.state, state
                ),
            ));
        }
        Ok(())
    }

    fn advance(&mut self, to: BootstrapState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(Error::internal_with_context(
                "bootstrap",
                format!("node {} cannot move {} -> {}", self.node.name, self.state, to),
            ));
        }
        debug!(node = %self.node.name, from = %self.state, to = %to, "Bootstrap state change");
        self.state = to;
        Ok(())
    }

    /// The node with its bootstrap credential dropped
    pub fn into_node(self) -> NodeInfo {
        self.node.without_credential()
    }
}

/// Drives nodes through the bootstrap state machine
pub struct NodeBootstrapper<'a> {
    backend: &'a dyn Backend,
    config: &'a OrchestratorConfig,
    cancel: &'a CancellationToken,
}

impl<'a> NodeBootstrapper<'a> {
    /// Bootstrapper over a backend
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

    fn shell(&self) -> RemoteShell<'a> {
        RemoteShell::new(self.backend)
    }

    /// `Provisioned -> InfrastructureReady`: wait for an address
    #[instrument(skip(self, boot), fields(node = %boot.node.name))]
    pub async fn wait_infrastructure_ready(&self, boot: &mut NodeBootstrap) -> Result<()> {
        boot.expect(BootstrapState::Provisioned)?;
        let node_id = boot.node.id.clone();
        let node_name = boot.node.name.clone();
        let description = format!("node {} infrastructure readiness", node_name);

        let state = poll_until(
            &self.config.infrastructure_ready,
            &description,
            self.cancel,
            || async {
                match self.backend.describe_node(&node_id).await? {
                    Some(state) if matches!(state.phase, NodePhase::ShuttingDown | NodePhase::Terminated) => {
                        Err(Error::creation(
                            ResourceClass::ComputeNode,
                            &node_name,
                            format!("node {} terminated while starting", node_id),
                        ))
                    }
                    Some(state) if state.has_address() => Ok(Some(state)),
                    _ => Ok(None),
                }
            },
        )
        .await?;

        boot.node.private_address = state.private_address;
        boot.node.public_address = state.public_address;
        info!(
            node = %boot.node.name,
            address = boot.node.address().unwrap_or_default(),
            "Node infrastructure ready"
        );
        boot.advance(BootstrapState::InfrastructureReady)
    }

    /// `InfrastructureReady -> BootstrapComplete`: wait for the completion marker
    #[instrument(skip(self, boot), fields(node = %boot.node.name))]
    pub async fn wait_bootstrap_complete(&self, boot: &mut NodeBootstrap) -> Result<()> {
        boot.expect(BootstrapState::InfrastructureReady)?;
        let shell = self.shell();
        shell.ensure_credential(&mut boot.node).await?;

        let node = &boot.node;
        let description = format!("node {} bootstrap completion", node.name);
        let check = commands::check_bootstrap_marker();
        poll_until(
            &self.config.bootstrap_complete,
            &description,
            self.cancel,
            || async {
                let output = shell.probe(node, &check).await?;
                Ok(output.success().then_some(()))
            },
        )
        .await?;

        info!(node = %boot.node.name, "Node bootstrap payload complete");
        boot.advance(BootstrapState::BootstrapComplete)
    }

    /// Run both wait phases
    pub async fn wait_ready(&self, boot: &mut NodeBootstrap) -> Result<()> {
        self.wait_infrastructure_ready(boot).await?;
        self.wait_bootstrap_complete(boot).await
    }

    /// Primary `BootstrapComplete -> RoleReady`: initialize the control plane
    /// and return the credentials other nodes join with
    #[instrument(skip(self, boot), fields(node = %boot.node.name))]
    pub async fn initialize_primary(
        &self,
        boot: &mut NodeBootstrap,
        endpoint_host: &str,
        kubernetes_version: &str,
        cni: Cni,
        multi_primary: bool,
    ) -> Result<JoinCredentials> {
        boot.expect(BootstrapState::BootstrapComplete)?;
        if boot.role != BootstrapRole::Primary {
            return Err(Error::internal_with_context(
                "bootstrap",
                format!("node {} is not the primary", boot.node.name),
            ));
        }
        self.check_cancelled("control plane initialization")?;

        let advertise = boot
            .node
            .private_address
            .clone()
            .or_else(|| boot.node.address().map(str::to_string))
            .unwrap_or_default();
        let init = commands::kubeadm_init(
            endpoint_host,
            &advertise,
            kubernetes_version,
            cni,
            multi_primary,
        );
        self.shell()
            .run_labeled(&boot.node, &init, "kubeadm init")
            .await?;
        info!(node = %boot.node.name, "Control plane initialized");

        let credentials = self.fetch_join_credentials(&boot.node, multi_primary).await?;
        boot.advance(BootstrapState::RoleReady)?;
        Ok(credentials)
    }

    /// Issue fresh join credentials from an initialized control-plane node
    ///
    /// The certificate key is only requested when another control-plane node
    /// is going to join.
    #[instrument(skip(self, primary), fields(node = %primary.name))]
    pub async fn fetch_join_credentials(
        &self,
        primary: &NodeInfo,
        with_certificate_key: bool,
    ) -> Result<JoinCredentials> {
        let shell = self.shell();
        let output = shell
            .run_labeled(primary, &commands::print_join_command(), "kubeadm token create")
            .await?;
        let mut credentials = parse_join_command(&output.stdout)?;

        if with_certificate_key {
            let output = shell
                .run_labeled(primary, &commands::upload_certs(), "kubeadm upload-certs")
                .await?;
            credentials.certificate_key = Some(parse_certificate_key(&output.stdout)?);
        }
        debug!(node = %primary.name, endpoint = %credentials.endpoint, "Fetched join credentials");
        Ok(credentials)
    }

    /// Non-primary `BootstrapComplete -> RoleReady`: join the cluster
    #[instrument(skip(self, boot, credentials), fields(node = %boot.node.name))]
    pub async fn join(&self, boot: &mut NodeBootstrap, credentials: &JoinCredentials) -> Result<()> {
        boot.expect(BootstrapState::BootstrapComplete)?;
        let control_plane = match boot.role {
            BootstrapRole::Primary => {
                return Err(Error::internal_with_context(
                    "bootstrap",
                    format!("primary node {} cannot join itself", boot.node.name),
                ))
            }
            BootstrapRole::JoinControlPlane => {
                if credentials.certificate_key.is_none() {
                    return Err(Error::validation(format!(
                        "control-plane node {} needs a certificate key to join",
                        boot.node.name
                    )));
                }
                true
            }
            BootstrapRole::Worker => false,
        };
        self.check_cancelled("node join")?;

        let join = commands::kubeadm_join(credentials, control_plane);
        self.shell()
            .run_labeled(&boot.node, &join, "kubeadm join")
            .await?;
        info!(node = %boot.node.name, control_plane = control_plane, "Node joined cluster");
        boot.advance(BootstrapState::RoleReady)
    }

    /// Install the networking layer from the primary node
    #[instrument(skip(self, primary), fields(node = %primary.name))]
    pub async fn install_cni(&self, primary: &NodeInfo, cni: Cni) -> Result<()> {
        self.check_cancelled("CNI installation")?;
        self.shell()
            .run(primary, &commands::apply_manifest(cni.manifest_url()))
            .await?;
        info!(cni = %cni, "Installed cluster networking");
        Ok(())
    }

    fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::{CommandOutput, NodeState};
    use crate::testing::FakeBackend;
    use kubeforge_common::types::NodeRole;

    fn node() -> NodeInfo {
        NodeInfo {
            id: "i-1".to_string(),
            name: "dev-cp-0".to_string(),
            private_address: None,
            public_address: None,
            machine_class: "t3.medium".to_string(),
            role: NodeRole::ControlPlane,
            node_group: None,
            credential: None,
        }
    }

    fn fake_with_node() -> FakeBackend {
        let backend = FakeBackend::new();
        backend.insert_node(NodeState {
            id: "i-1".to_string(),
            phase: NodePhase::Pending,
            private_address: None,
            public_address: None,
            machine_class: "t3.medium".to_string(),
        });
        backend
    }

    // ==========================================================================
    // Story Tests: Bringing a Node From Created to Joined
    // ==========================================================================

    /// Story: the primary goes through every state in order and hands out join credentials
    #[tokio::test(start_paused = true)]
    async fn story_primary_reaches_role_ready() {
        let backend = fake_with_node();
        backend.assign_address_after("i-1", 2);
        let config = OrchestratorConfig::default();
        let cancel = CancellationToken::new();
        let bootstrapper = NodeBootstrapper::new(&backend, &config, &cancel);

        let mut boot = NodeBootstrap::new(node(), BootstrapRole::Primary);
        bootstrapper.wait_infrastructure_ready(&mut boot).await.unwrap();
        assert_eq!(boot.state(), BootstrapState::InfrastructureReady);
        assert!(boot.node.address().is_some());

        bootstrapper.wait_bootstrap_complete(&mut boot).await.unwrap();
        assert_eq!(boot.state(), BootstrapState::BootstrapComplete);

        let creds = bootstrapper
            .initialize_primary(&mut boot, "54.0.0.1", "1.30.2", Cni::Calico, true)
            .await
            .unwrap();
        assert_eq!(boot.state(), BootstrapState::RoleReady);
        assert!(creds.certificate_key.is_some());
        assert!(backend.ran_command_containing("kubeadm init"));
        assert!(boot.into_node().credential.is_none());
    }

    /// Story: a node whose payload never finishes fails with a timeout
    #[tokio::test(start_paused = true)]
    async fn story_bootstrap_marker_never_appears() {
        let backend = fake_with_node();
        backend.respond("test -f", CommandOutput::failed(1, ""));
        let config = OrchestratorConfig::default();
        let cancel = CancellationToken::new();
        let bootstrapper = NodeBootstrapper::new(&backend, &config, &cancel);

        let mut boot = NodeBootstrap::new(node(), BootstrapRole::Worker);
        bootstrapper.wait_infrastructure_ready(&mut boot).await.unwrap();
        let err = bootstrapper.wait_bootstrap_complete(&mut boot).await.unwrap_err();

        match err {
            Error::Timeout { duration, .. } => assert_eq!(duration, Duration::from_secs(900)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(boot.state(), BootstrapState::InfrastructureReady);
    }

    /// Story: a node the backend terminates during startup fails immediately
    #[tokio::test(start_paused = true)]
    async fn story_node_terminated_during_startup() {
        let backend = fake_with_node();
        backend.set_node_phase("i-1", NodePhase::Terminated);
        let config = OrchestratorConfig::default();
        let cancel = CancellationToken::new();
        let bootstrapper = NodeBootstrapper::new(&backend, &config, &cancel);

        let mut boot = NodeBootstrap::new(node(), BootstrapRole::Worker);
        let err = bootstrapper.wait_infrastructure_ready(&mut boot).await.unwrap_err();
        assert!(matches!(err, Error::ResourceCreation { .. }));
    }

    /// Story: states cannot be skipped
    #[tokio::test(start_paused = true)]
    async fn story_join_before_bootstrap_complete_is_rejected() {
        let backend = fake_with_node();
        let config = OrchestratorConfig::default();
        let cancel = CancellationToken::new();
        let bootstrapper = NodeBootstrapper::new(&backend, &config, &cancel);

        let creds = JoinCredentials {
            endpoint: "10.0.1.10:6443".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            ca_cert_hash: "sha256:00".to_string(),
            certificate_key: None,
        };
        let mut boot = NodeBootstrap::new(node(), BootstrapRole::Worker);
        assert!(bootstrapper.join(&mut boot, &creds).await.is_err());
        assert_eq!(boot.state(), BootstrapState::Provisioned);
    }

    #[tokio::test(start_paused = true)]
    async fn control_plane_join_requires_certificate_key() {
        let backend = fake_with_node();
        let config = OrchestratorConfig::default();
        let cancel = CancellationToken::new();
        let bootstrapper = NodeBootstrapper::new(&backend, &config, &cancel);

        let mut boot = NodeBootstrap::new(node(), BootstrapRole::JoinControlPlane);
        bootstrapper.wait_ready(&mut boot).await.unwrap();
        let creds = JoinCredentials {
            endpoint: "10.0.1.10:6443".to_string(),
            token: "abcdef.0123456789abcdef".to_string(),
            ca_cert_hash: "sha256:00".to_string(),
            certificate_key: None,
        };
        let err = bootstrapper.join(&mut boot, &creds).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!backend.ran_command_containing("kubeadm join"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting() {
        let backend = fake_with_node();
        backend.respond("test -f", CommandOutput::failed(1, ""));
        let config = OrchestratorConfig::default();
        let cancel = CancellationToken::new();
        let bootstrapper = NodeBootstrapper::new(&backend, &config, &cancel);

        let mut boot = NodeBootstrap::new(node(), BootstrapRole::Worker);
        bootstrapper.wait_infrastructure_ready(&mut boot).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });
        let err = bootstrapper.wait_bootstrap_complete(&mut boot).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn state_order_is_linear() {
        assert_eq!(
            BootstrapState::Provisioned.next(),
            Some(BootstrapState::InfrastructureReady)
        );
        assert_eq!(BootstrapState::RoleReady.next(), None);
        assert!(BootstrapState::Provisioned < BootstrapState::RoleReady);
    }
}
