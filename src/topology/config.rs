//! Topology file configuration types

use crate::deployment::DeploymentConfig;
use crate::error::{DeployError, Result};
use crate::host::{AuthMaterial, HostKind, Reachability};
use crate::service::{CrateSpec, ExternalSpec, ServiceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Topology file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Topology name
    #[serde(default)]
    pub name: Option<String>,
    /// Deployment settings
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Hosts besides the built-in `localhost`
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Connections between service ports
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// Deployment settings overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Seconds a stop waits before killing a service
    #[serde(default)]
    pub stop_timeout_secs: Option<u64>,
    /// Dial attempts per connection
    #[serde(default)]
    pub dial_attempts: Option<u32>,
    /// Milliseconds between dial attempts
    #[serde(default)]
    pub dial_delay_ms: Option<u64>,
    /// Milliseconds output may keep arriving after a service exits
    #[serde(default)]
    pub output_drain_ms: Option<u64>,
    /// Services launched at the same time
    #[serde(default)]
    pub launch_concurrency: Option<usize>,
    /// Ports reserved for listeners on remote hosts, `[first, last]`
    #[serde(default)]
    pub port_range: Option<(u16, u16)>,
}

impl SettingsConfig {
    /// Apply the overrides on top of `base`
    pub fn apply(&self, base: DeploymentConfig) -> DeploymentConfig {
        let mut config = base;
        if let Some(secs) = self.stop_timeout_secs {
            config = config.stop_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.dial_attempts {
            config = config.dial_attempts(attempts);
        }
        if let Some(ms) = self.dial_delay_ms {
            config = config.dial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.output_drain_ms {
            config = config.output_drain_interval(Duration::from_millis(ms));
        }
        if let Some(concurrency) = self.launch_concurrency {
            config = config.launch_concurrency(concurrency);
        }
        if let Some((first, last)) = self.port_range {
            config = config.port_range(first..=last);
        }
        config
    }
}

/// Host declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host kind and parameters
    #[serde(flatten)]
    pub kind: HostKind,
    /// Address of an already running machine
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Address reachable from outside the host's network
    #[serde(default)]
    pub external_address: Option<IpAddr>,
    /// Credentials
    #[serde(default)]
    pub auth: Option<AuthMaterial>,
}

impl HostConfig {
    /// Static reachability, when an address is declared
    pub fn reachability(&self) -> Option<Reachability> {
        let address = self.address?;
        let mut reachability = Reachability::new(address);
        if let Some(external) = self.external_address {
            reachability = reachability.external(external);
        }
        if let Some(auth) = &self.auth {
            reachability = reachability.auth(auth.clone());
        }
        Some(reachability)
    }
}

/// Service declaration. A service with a `path` is a crate the engine builds
/// and launches; one marked `external` is driven by someone else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Host name, `localhost` when unset
    #[serde(default)]
    pub host: Option<String>,
    /// Place the service on a client-only projection of its host
    #[serde(default)]
    pub client_only: bool,
    /// Crate source directory
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Binary target
    #[serde(default)]
    pub bin: Option<String>,
    /// Example target
    #[serde(default)]
    pub example: Option<String>,
    /// Build profile
    #[serde(default)]
    pub profile: Option<String>,
    /// Cargo features
    #[serde(default)]
    pub features: Vec<String>,
    /// Launch arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Name shown in output prefixes
    #[serde(default)]
    pub display_name: Option<String>,
    /// Service is not launched by the engine
    #[serde(default)]
    pub external: bool,
    /// TCP ports an external service exposes
    #[serde(default)]
    pub external_ports: Vec<u16>,
}

impl ServiceConfig {
    /// Host name the service is placed on
    pub fn host_name(&self) -> &str {
        self.host.as_deref().unwrap_or(crate::deployment::LOCALHOST)
    }

    /// Service kind described by this declaration
    pub fn kind(&self, name: &str) -> Result<ServiceKind> {
        match (&self.path, self.external) {
            (Some(_), true) => Err(DeployError::Topology(format!(
                "service '{}' is external and cannot have a crate path",
                name
            ))),
            (None, false) => Err(DeployError::Topology(format!(
                "service '{}' must have either 'path' or 'external: true'",
                name
            ))),
            (None, true) => Ok(ExternalSpec {
                external_ports: self.external_ports.clone(),
            }
            .into()),
            (Some(path), false) => {
                if self.bin.is_some() && self.example.is_some() {
                    return Err(DeployError::Topology(format!(
                        "service '{}' cannot set both 'bin' and 'example'",
                        name
                    )));
                }
                let mut spec = CrateSpec::new(path.clone())
                    .features(self.features.iter().cloned())
                    .args(self.args.iter().cloned());
                if let Some(bin) = &self.bin {
                    spec = spec.bin(bin);
                }
                if let Some(example) = &self.example {
                    spec = spec.example(example);
                }
                if let Some(profile) = &self.profile {
                    spec = spec.profile(profile);
                }
                if let Some(display_name) = &self.display_name {
                    spec = spec.display_name(display_name);
                }
                Ok(spec.into())
            }
        }
    }
}

/// Connection declaration. A missing or null end is the null endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Emitting side
    #[serde(default)]
    pub from: Option<SourceConfig>,
    /// Receiving side
    #[serde(default)]
    pub to: Option<SinkConfig>,
}

/// Emitting side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceConfig {
    /// `service.port`
    Port(String),
    /// Frames prefixed with a tag
    Tagged { tagged: Box<SourceConfig>, tag: u32 },
}

/// Receiving side of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SinkConfig {
    /// `service.port`
    Port(String),
    /// Destination accepting several inbound connections
    Merge { merge: String },
    /// Dispatch on the leading tag of every frame; null routes discard
    Demux { demux: BTreeMap<u32, Option<SinkConfig>> },
}

/// Split `service.port` into its parts
pub fn parse_port_ref(reference: &str) -> Result<(&str, &str)> {
    match reference.split_once('.') {
        Some((service, port)) if !service.is_empty() && !port.is_empty() => Ok((service, port)),
        _ => Err(DeployError::Topology(format!(
            "invalid port reference '{}', expected 'service.port'",
            reference
        ))),
    }
}

impl SourceConfig {
    /// Port reference at the root of this source
    pub fn port_ref(&self) -> &str {
        match self {
            SourceConfig::Port(reference) => reference,
            SourceConfig::Tagged { tagged, .. } => tagged.port_ref(),
        }
    }
}

impl SinkConfig {
    /// Every port reference in this sink
    pub fn port_refs(&self) -> Vec<&str> {
        match self {
            SinkConfig::Port(reference) | SinkConfig::Merge { merge: reference } => vec![reference.as_str()],
            SinkConfig::Demux { demux } => demux
                .values()
                .flatten()
                .flat_map(|sink| sink.port_refs())
                .collect(),
        }
    }
}
