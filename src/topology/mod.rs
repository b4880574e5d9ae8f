//! Topology files: YAML descriptions of hosts, services and connections

pub mod builder;
pub mod config;
pub mod parser;

pub use builder::TopologyBuilder;
pub use config::{ConnectionConfig, HostConfig, ServiceConfig, SettingsConfig, SinkConfig, SourceConfig, TopologyConfig};
pub use parser::{interpolate, TopologyParser};
