//! Remote command execution on cluster nodes

use tracing::debug;

use kubeforge_common::types::NodeInfo;
use kubeforge_common::{Error, Result};

use crate::backend::{Backend, CommandOutput, RemoteTarget};

/// Runs commands on nodes through the backend's remote execution
pub struct RemoteShell<'a> {
    backend: &'a dyn Backend,
}

impl<'a> RemoteShell<'a> {
    /// Shell over a backend
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Make sure the node carries a usable credential, issuing one if needed
    pub async fn ensure_credential(&self, node: &mut NodeInfo) -> Result<()> {
        let usable = node
            .credential
            .as_ref()
            .map(|c| !c.is_expired())
            .unwrap_or(false);
        if !usable {
            debug!(node = %node.name, "Issuing remote execution credential");
            node.credential = Some(self.backend.issue_credential(node).await?);
        }
        Ok(())
    }

    async fn target(&self, node: &NodeInfo) -> Result<RemoteTarget> {
        let address = node.address().ok_or_else(|| {
            Error::internal_with_context(
                "remote",
                format!("node {} has no address yet", node.name),
            )
        })?;
        let credential = match node.credential {
            Some(ref c) if !c.is_expired() => c.clone(),
            _ => self.backend.issue_credential(node).await?,
        };
        Ok(RemoteTarget {
            node_id: node.id.clone(),
            address: address.to_string(),
            credential,
        })
    }

    /// Run a command and return its output whatever the exit code
    pub async fn probe(&self, node: &NodeInfo, command: &str) -> Result<CommandOutput> {
        let target = self.target(node).await?;
        self.backend.run_command(&target, command).await
    }

    /// Run a command, turning a non-zero exit into `Error::RemoteCommand`
    pub async fn run(&self, node: &NodeInfo, command: &str) -> Result<CommandOutput> {
        self.run_labeled(node, command, command).await
    }

    /// Like [`run`](Self::run) but logs and reports `label` instead of the
    /// command line, for commands carrying secrets
    pub async fn run_labeled(
        &self,
        node: &NodeInfo,
        command: &str,
        label: &str,
    ) -> Result<CommandOutput> {
        debug!(node = %node.name, command = %label, "Running remote command");
        let output = self.probe(node, command).await?;
        if !output.success() {
            return Err(Error::remote_command(
                &node.name,
                label,
                output.exit_code,
                output.stderr.trim(),
            ));
        }
        Ok(output)
    }
}
