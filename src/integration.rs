//! Runtime side of a deployed service
//!
//! A managed service receives its [`LaunchConfig`] as the first line on
//! stdin and in the `RUNE_DEPLOY_CONFIG` environment variable. It looks up
//! its ports by name and connects them:
//!
//! ```no_run
//! # async fn run() -> rune_deploy::error::Result<()> {
//! use rune_deploy::integration::LaunchConfig;
//!
//! let config = LaunchConfig::from_env_or_stdin().await?;
//! let output = config.connect("out").await?;
//! output.send(&b"hello"[..]).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{DeployError, Result};
use crate::network::{ConnectedPort, PortConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Environment variable carrying the JSON launch configuration
pub const CONFIG_ENV: &str = "RUNE_DEPLOY_CONFIG";

/// Configuration handed to a service at launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Display id of the service
    pub service: String,
    /// Resolved port configurations by port name
    #[serde(default)]
    pub ports: BTreeMap<String, PortConfig>,
    /// Launch arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl LaunchConfig {
    /// Create an empty launch configuration
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ports: BTreeMap::new(),
            args: Vec::new(),
        }
    }

    /// Add a port
    pub fn with_port(mut self, name: &str, config: PortConfig) -> Self {
        self.ports.insert(name.to_string(), config);
        self
    }

    /// Set launch arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Configuration of a named port
    pub fn port(&self, name: &str) -> Result<&PortConfig> {
        self.ports.get(name).ok_or_else(|| {
            DeployError::InvalidConnection(format!(
                "service {} has no connected port named {}",
                self.service, name
            ))
        })
    }

    /// Connect a named port
    pub async fn connect(&self, name: &str) -> Result<ConnectedPort> {
        self.port(name)?.connect().await
    }

    /// Single-line JSON encoding
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON encoding
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json.trim())?)
    }

    /// Read the configuration from the environment, if set
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Read the configuration from the first line on stdin
    pub async fn from_stdin() -> Result<Self> {
        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Err(DeployError::StreamClosed(
                "stdin closed before launch configuration".to_string(),
            ));
        }
        Self::from_json(&line)
    }

    /// Read the configuration from the environment, falling back to stdin
    pub async fn from_env_or_stdin() -> Result<Self> {
        match Self::from_env()? {
            Some(config) => Ok(config),
            None => Self::from_stdin().await,
        }
    }
}

/// Wait until the engine asks this service to stop
#[cfg(unix)]
pub async fn stop_requested() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => {}
        result = tokio::signal::ctrl_c() => result?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_config_json() {
        let config = LaunchConfig::new("echo")
            .with_port("out", PortConfig::Dial("127.0.0.1:4000".parse().unwrap()))
            .with_port("drop", PortConfig::Null)
            .with_args(vec!["--fast".to_string()]);

        let json = config.to_json().unwrap();
        assert!(!json.contains('\n'));

        let parsed = LaunchConfig::from_json(&format!("{}\n", json)).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.port("drop").unwrap(), &PortConfig::Null);
        assert!(matches!(
            parsed.port("missing"),
            Err(DeployError::InvalidConnection(_))
        ));
    }

    #[test]
    fn test_defaults_when_fields_missing() {
        let config = LaunchConfig::from_json(r#"{"service":"bare"}"#).unwrap();
        assert!(config.ports.is_empty());
        assert!(config.args.is_empty());
    }
}
