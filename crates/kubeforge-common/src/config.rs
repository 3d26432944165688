//! Orchestrator configuration.
//!
//! Holds the timeout catalog for every wait loop, the deletion retry policy
//! and where trackers are persisted. The file resolution chain (highest
//! priority first):
//! 1. Explicit path passed by the caller
//! 2. `KUBEFORGE_CONFIG` environment variable
//! 3. `~/.kubeforge/config.yaml`
//! 4. Built-in defaults
//!
//! Files are YAML; JSON works too since it is a YAML subset. Fields left out
//! of a file keep their default values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::{duration_secs, PollConfig, RetryConfig};
use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".kubeforge";
const CONFIG_FILE_NAME: &str = "config.yaml";
const STATE_DIR_NAME: &str = "state";
const KUBEFORGE_CONFIG_ENV: &str = "KUBEFORGE_CONFIG";

/// Tunables for the orchestration core
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Wait for a new node to get an address
    pub infrastructure_ready: PollConfig,
    /// Wait for a node's bootstrap payload to leave its completion marker
    pub bootstrap_complete: PollConfig,
    /// Wait for terminated nodes to reach their terminal state
    pub node_termination: PollConfig,
    /// Wait for a freshly created network to become available
    pub network_available: PollConfig,
    /// Wait for every node to report Ready
    pub health_check: PollConfig,
    /// Retry policy for deletes rejected with a dependency violation
    pub deletion_retry: RetryConfig,
    /// Pause between revoking security rules and deleting the boundaries
    #[serde(with = "duration_secs")]
    pub security_rule_propagation: Duration,
    /// Address range of the cluster network
    pub network_cidr: String,
    /// Directory for persisted resource trackers (default `~/.kubeforge/state`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            infrastructure_ready: PollConfig::new(Duration::from_secs(120), Duration::from_secs(5)),
            bootstrap_complete: PollConfig::new(Duration::from_secs(900), Duration::from_secs(15)),
            node_termination: PollConfig::new(Duration::from_secs(600), Duration::from_secs(10)),
            network_available: PollConfig::new(Duration::from_secs(300), Duration::from_secs(5)),
            health_check: PollConfig::new(Duration::from_secs(600), Duration::from_secs(15)),
            deletion_retry: RetryConfig::new(6, Duration::from_secs(5)),
            security_rule_propagation: Duration::from_secs(10),
            network_cidr: "10.0.0.0/16".to_string(),
            state_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration following the resolution chain
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env = std::env::var(KUBEFORGE_CONFIG_ENV).ok();
        match resolve_config_path(explicit, env.as_deref(), default_config_path()) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::internal_with_context(
                "config",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        let config: Self = serde_yaml::from_str(&data).map_err(|e| {
            Error::serialization(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded orchestrator configuration");
        Ok(config)
    }

    /// Reject settings that would make every wait fail or spin
    pub fn validate(&self) -> Result<()> {
        let polls = [
            ("infrastructureReady", &self.infrastructure_ready),
            ("bootstrapComplete", &self.bootstrap_complete),
            ("nodeTermination", &self.node_termination),
            ("networkAvailable", &self.network_available),
            ("healthCheck", &self.health_check),
        ];
        for (field, poll) in polls {
            if poll.interval.is_zero() {
                return Err(Error::configuration_field(
                    "orchestrator",
                    format!("{}.interval", field),
                    "poll interval must be at least 1 second",
                ));
            }
        }
        if self.deletion_retry.max_attempts == 0 {
            return Err(Error::configuration_field(
                "orchestrator",
                "deletionRetry.maxAttempts",
                "at least one attempt is required",
            ));
        }
        if self.network_cidr.split_once('/').is_none() {
            return Err(Error::configuration_field(
                "orchestrator",
                "networkCidr",
                format!("expected CIDR notation, got '{}'", self.network_cidr),
            ));
        }
        Ok(())
    }

    /// Directory trackers are persisted under
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.state_dir {
            return Ok(dir.clone());
        }
        Ok(kubeforge_dir()?.join(STATE_DIR_NAME))
    }
}

/// Returns `~/.kubeforge/` (not created)
pub fn kubeforge_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::internal_with_context("config", "could not determine home directory")
    })?;
    Ok(home.join(CONFIG_DIR_NAME))
}

fn default_config_path() -> Option<PathBuf> {
    kubeforge_dir().ok().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Pick the config file to load, if any.
///
/// An explicit path or a non-empty environment value is returned even if the
/// file is missing so the read error surfaces; the home default is only used
/// when it exists.
fn resolve_config_path(
    explicit: Option<&Path>,
    env: Option<&str>,
    default: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(path) = env {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default.filter(|p| p.exists())
}
