//! Service kinds and build parameters

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Service identifier, unique within a deployment
pub type ServiceId = usize;

/// Which target of a crate to build and run
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrateTarget {
    /// The crate's only binary
    #[default]
    Default,
    /// A named binary
    Bin(String),
    /// A named example
    Example(String),
}

/// A crate compiled and launched by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrateSpec {
    /// Crate source directory
    pub src: PathBuf,
    /// Target to build
    #[serde(default)]
    pub target: CrateTarget,
    /// Build profile, `dev` when unset
    #[serde(default)]
    pub profile: Option<String>,
    /// Cargo features to enable
    #[serde(default)]
    pub features: Vec<String>,
    /// Launch arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Name shown in output prefixes
    #[serde(default)]
    pub display_name: Option<String>,
}

impl CrateSpec {
    /// Create a spec for the crate at `src`
    pub fn new(src: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            target: CrateTarget::Default,
            profile: None,
            features: Vec::new(),
            args: Vec::new(),
            display_name: None,
        }
    }

    /// Build a named binary
    pub fn bin(mut self, name: &str) -> Self {
        self.target = CrateTarget::Bin(name.to_string());
        self
    }

    /// Build a named example
    pub fn example(mut self, name: &str) -> Self {
        self.target = CrateTarget::Example(name.to_string());
        self
    }

    /// Set the build profile
    pub fn profile(mut self, profile: &str) -> Self {
        self.profile = Some(profile.to_string());
        self
    }

    /// Enable features
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    /// Append launch arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the display name
    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }
}

/// A service managed outside the engine, reachable on declared ports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSpec {
    /// TCP ports the service exposes
    #[serde(default)]
    pub external_ports: Vec<u16>,
}

impl ExternalSpec {
    /// Create an external service spec
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an exposed TCP port
    pub fn port(mut self, port: u16) -> Self {
        self.external_ports.push(port);
        self
    }
}

/// What a service is and how it comes to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Built and launched by the engine
    ManagedCrate(CrateSpec),
    /// Already running or driven in-process by the caller
    External(ExternalSpec),
}

impl ServiceKind {
    /// Whether the engine launches this service
    pub fn is_managed(&self) -> bool {
        matches!(self, ServiceKind::ManagedCrate(_))
    }

    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::ManagedCrate(_) => "crate",
            ServiceKind::External(_) => "external",
        }
    }
}

impl From<CrateSpec> for ServiceKind {
    fn from(spec: CrateSpec) -> Self {
        ServiceKind::ManagedCrate(spec)
    }
}

impl From<ExternalSpec> for ServiceKind {
    fn from(spec: ExternalSpec) -> Self {
        ServiceKind::External(spec)
    }
}
