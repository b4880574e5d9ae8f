//! Service launch capability
//!
//! A [`Launcher`] turns a managed crate plus its resolved launch
//! configuration into a running [`LaunchedProcess`].

pub mod local;
#[cfg(test)]
pub(crate) mod mock;
pub mod output;

pub use local::LocalLauncher;
pub use output::{OutputChannel, OutputLog, OutputStream};

use crate::error::Result;
use crate::host::Host;
use crate::integration::LaunchConfig;
use crate::scheduler::Scheduler;
use crate::service::{CrateSpec, ServiceId};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything needed to launch one managed service
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Service being launched
    pub service: ServiceId,
    /// Name used as output prefix
    pub display_id: String,
    /// Host the service runs on
    pub host: Host,
    /// Crate to build and run
    pub spec: CrateSpec,
    /// Configuration pushed to the process
    pub config: LaunchConfig,
}

/// Launches managed services
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch a service. Output readers are spawned on `scheduler`.
    async fn launch(&self, spec: &LaunchSpec, scheduler: &Scheduler) -> Result<Arc<dyn LaunchedProcess>>;
}

/// Handle to a running service instance
#[async_trait]
pub trait LaunchedProcess: Send + Sync {
    /// OS process id, if any
    fn pid(&self) -> Option<u32>;

    /// Standard output log
    fn stdout(&self) -> Arc<OutputLog>;

    /// Standard error log
    fn stderr(&self) -> Arc<OutputLog>;

    /// Exit code, once known
    fn exit_code(&self) -> Option<i32>;

    /// Wait for the process to exit and return its exit code
    async fn wait(&self) -> Result<i32>;

    /// Ask the process to terminate
    fn signal_stop(&self) -> Result<()>;

    /// Terminate the process immediately
    fn kill(&self) -> Result<()>;
}
