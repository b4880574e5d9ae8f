//! Deployment phase state and phase reports

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase shared by the whole graph. Only moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Graph under construction
    #[default]
    Building,
    /// Hosts provisioned and ports resolved
    Deployed,
    /// Services launched
    Started,
    /// Services stopped
    Stopped,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentState::Building => write!(f, "building"),
            DeploymentState::Deployed => write!(f, "deployed"),
            DeploymentState::Started => write!(f, "started"),
            DeploymentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Outcome of starting a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    /// Services launched
    pub launched: Vec<String>,
    /// Services whose launch failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    /// Whether every managed service launched
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
