//! Topology file parser

use super::config::{parse_port_ref, SinkConfig, TopologyConfig};
use crate::deployment::LOCALHOST;
use crate::error::{DeployError, Result};
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Default topology file names
pub const DEFAULT_TOPOLOGY_FILES: &[&str] = &["topology.yaml", "topology.yml", "rune-deploy.yaml"];

/// Topology file parser
pub struct TopologyParser;

impl TopologyParser {
    /// Find a topology file in a directory
    pub fn find_topology_file(dir: &Path) -> Option<std::path::PathBuf> {
        DEFAULT_TOPOLOGY_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse a topology file, interpolating the process environment
    pub fn parse_file(path: &Path) -> Result<TopologyConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeployError::TopologyParse(format!("Failed to read {}: {}", path.display(), e)))?;

        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_str_with_env(&content, &env)
    }

    /// Parse a topology from a string without interpolation
    pub fn parse_str(content: &str) -> Result<TopologyConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| DeployError::TopologyParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Interpolate `env` into `content`, then parse it
    pub fn parse_str_with_env(content: &str, env: &HashMap<String, String>) -> Result<TopologyConfig> {
        Self::parse_str(&interpolate(content, env)?)
    }

    /// Validate references and service declarations. Returns warnings for
    /// things that deploy but are probably mistakes.
    pub fn validate(config: &TopologyConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.hosts.contains_key(LOCALHOST) {
            return Err(DeployError::Topology(format!(
                "host name '{}' is reserved for the local machine",
                LOCALHOST
            )));
        }

        for (name, host) in &config.hosts {
            if host.address.is_none() {
                warnings.push(format!(
                    "Host '{}' has no address and must be provisioned by a custom provisioner",
                    name
                ));
            }
        }

        let mut used_hosts = HashSet::new();
        for (name, service) in &config.services {
            let kind = service.kind(name)?;
            let host = service.host_name();
            if host != LOCALHOST && !config.hosts.contains_key(host) {
                return Err(DeployError::Topology(format!(
                    "Service '{}' is placed on unknown host '{}'",
                    name, host
                )));
            }
            used_hosts.insert(host);

            if kind.is_managed() && !service.external_ports.is_empty() {
                warnings.push(format!(
                    "Service '{}' is a crate, 'external_ports' is ignored",
                    name
                ));
            }
        }

        for name in config.hosts.keys() {
            if !used_hosts.contains(name.as_str()) {
                warnings.push(format!("Host '{}' has no services", name));
            }
        }

        let mut connected = HashSet::new();
        for (i, connection) in config.connections.iter().enumerate() {
            let mut refs = Vec::new();
            if let Some(source) = &connection.from {
                refs.push(source.port_ref());
            }
            if let Some(sink) = &connection.to {
                if matches!(sink, SinkConfig::Demux { demux } if demux.is_empty()) {
                    return Err(DeployError::Topology(format!(
                        "Connection {} has an empty demux",
                        i
                    )));
                }
                refs.extend(sink.port_refs());
            }
            if connection.from.is_none() && connection.to.is_none() {
                return Err(DeployError::Topology(format!(
                    "Connection {} connects null to null",
                    i
                )));
            }

            for reference in refs {
                let (service, _) = parse_port_ref(reference)?;
                if !config.services.contains_key(service) {
                    return Err(DeployError::Topology(format!(
                        "Connection {} references unknown service '{}'",
                        i, service
                    )));
                }
                connected.insert(service);
            }
        }

        for name in config.services.keys() {
            if !connected.contains(name.as_str()) {
                warnings.push(format!("Service '{}' has no connections", name));
            }
        }

        Ok(warnings)
    }
}

/// Replace `${VAR}` and `${VAR:-default}` with values from `env`. A variable
/// with no value and no default becomes empty.
pub fn interpolate(content: &str, env: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| DeployError::Internal(format!("invalid interpolation pattern: {}", e)))?;

    let result = re.replace_all(content, |caps: &Captures| {
        let var = &caps[1];
        match (env.get(var), caps.get(2)) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                tracing::warn!("Variable {} is not set, using an empty string", var);
                String::new()
            }
        }
    });
    Ok(result.into_owned())
}
