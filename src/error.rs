//! Error types for rune-deploy

use thiserror::Error;

/// Result type for rune-deploy operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// rune-deploy error types
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Failed to provision host {host}: {message}")]
    Provisioning { host: String, message: String },

    #[error("Port bind error: {0}")]
    PortBind(String),

    #[error("Failed to launch service {service}: {message}")]
    Launch { service: String, message: String },

    #[error("No demux destination registered for tag {0}")]
    DemuxTag(u32),

    #[error("Cannot {operation} while deployment is {state}")]
    InvalidPhase { operation: String, state: String },

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Service not launched: {0}")]
    NotLaunched(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Topology file parse error: {0}")]
    TopologyParse(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
