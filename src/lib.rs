//! rune-deploy - Deployment graph orchestration
//!
//! rune-deploy describes a distributed system as a graph of hosts, services
//! and connections between named service ports, then drives it through its
//! lifecycle:
//!
//! - Provisioning hosts and resolving how they reach each other
//! - Binding ports and routing frames (merge, demux, tagged, null)
//! - Building and launching Rust crates with their port configuration
//! - Streaming service output and stopping services
//! - Loading the graph from YAML topology files
//!
//! Launched crates read their configuration through [`integration`].

pub mod deployment;
pub mod error;
pub mod host;
pub mod integration;
pub mod launch;
pub mod network;
pub mod port;
pub mod scheduler;
pub mod service;
pub mod topology;

pub use deployment::{Deployment, DeploymentConfig, DeploymentState, StartReport};
pub use error::{DeployError, Result};
pub use host::{Host, HostKind};
pub use integration::LaunchConfig;
pub use network::{ConnectedPort, PortConfig};
pub use port::{Port, Sink, Source};
pub use service::{CrateSpec, ExternalSpec, Service, ServiceKind, ServiceState};
