//! Services: deployable units placed on a host
//!
//! A service owns a table of named ports and, once launched, a runtime
//! record tracking its process.

pub mod config;
pub mod runtime;

pub use config::{CrateSpec, CrateTarget, ExternalSpec, ServiceId, ServiceKind};
pub use runtime::{RuntimeRecord, ServiceState};

use crate::error::{DeployError, Result};
use crate::host::Host;
use crate::integration::LaunchConfig;
use crate::launch::{LaunchSpec, LaunchedProcess, Launcher, OutputStream};
use crate::port::Port;
use crate::scheduler::Scheduler;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Timing settings applied to every service of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    /// How long a stop waits before killing the process
    pub stop_timeout: Duration,
    /// How long output may keep arriving after exit
    pub output_drain_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(60),
            output_drain_interval: Duration::from_millis(500),
        }
    }
}

/// A deployable unit bound to one host
pub struct Service {
    id: ServiceId,
    name: String,
    host: Host,
    kind: ServiceKind,
    deployment_id: String,
    settings: ServiceSettings,
    ports: Mutex<BTreeMap<String, Arc<Port>>>,
    deployed: Arc<AtomicBool>,
    runtime: RuntimeRecord,
}

impl Service {
    pub(crate) fn new(
        id: ServiceId,
        name: &str,
        host: Host,
        kind: ServiceKind,
        deployment_id: &str,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            host,
            kind,
            deployment_id: deployment_id.to_string(),
            settings,
            ports: Mutex::new(BTreeMap::new()),
            deployed: Arc::new(AtomicBool::new(false)),
            runtime: RuntimeRecord::new(),
        }
    }

    /// Service ID
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name used to prefix output lines
    pub fn display_id(&self) -> &str {
        match &self.kind {
            ServiceKind::ManagedCrate(spec) => spec.display_name.as_deref().unwrap_or(&self.name),
            ServiceKind::External(_) => &self.name,
        }
    }

    /// Host the service is placed on
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Service kind
    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub(crate) fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Port with the given name, created on first access
    pub fn port(&self, name: &str) -> Arc<Port> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    Port::new(self.id, &self.name, name, self.kind.is_managed(), &self.deployment_id)
                        .deployed_flag(self.deployed.clone()),
                )
            })
            .clone()
    }

    /// Record that deploy finished. Ports it did not resolve are now known
    /// to have no connection.
    pub(crate) fn mark_deployed(&self) {
        self.deployed.store(true, Ordering::Release);
    }

    /// Every port accessed so far, by name
    pub fn ports(&self) -> Vec<Arc<Port>> {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.values().cloned().collect()
    }

    /// Runtime record
    pub fn runtime(&self) -> &RuntimeRecord {
        &self.runtime
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        self.runtime.state()
    }

    /// OS process id, while launched
    pub fn pid(&self) -> Option<u32> {
        self.runtime.process().and_then(|p| p.pid())
    }

    fn process(&self) -> Result<&Arc<dyn LaunchedProcess>> {
        self.runtime
            .process()
            .ok_or_else(|| DeployError::NotLaunched(self.name.clone()))
    }

    /// Standard output from the first line
    pub fn stdout(&self) -> Result<OutputStream> {
        Ok(self.process()?.stdout().subscribe())
    }

    /// Standard error from the first line
    pub fn stderr(&self) -> Result<OutputStream> {
        Ok(self.process()?.stderr().subscribe())
    }

    /// Exit code, waiting for the process to exit if it is still running
    pub async fn exit_code(&self) -> Result<i32> {
        match self.runtime.state() {
            ServiceState::Unlaunched => Err(DeployError::NotLaunched(self.name.clone())),
            ServiceState::LaunchFailed(reason) => Err(DeployError::Launch {
                service: self.name.clone(),
                message: reason,
            }),
            ServiceState::Exited(code) => Ok(code),
            ServiceState::Running => match self.runtime.wait_terminal().await {
                ServiceState::Exited(code) => Ok(code),
                other => Err(DeployError::Internal(format!(
                    "service {} ended in state {}",
                    self.name, other
                ))),
            },
        }
    }

    /// Ask the process to terminate and wait for its exit code. Kills the
    /// process if it is still running after the stop timeout.
    pub async fn stop(&self) -> Result<i32> {
        let process = match self.runtime.state() {
            ServiceState::Exited(code) => return Ok(code),
            ServiceState::Unlaunched => return Err(DeployError::NotLaunched(self.name.clone())),
            ServiceState::LaunchFailed(reason) => {
                return Err(DeployError::Launch {
                    service: self.name.clone(),
                    message: reason,
                })
            }
            ServiceState::Running => self.process()?.clone(),
        };

        tracing::info!("Stopping service {}", self.display_id());
        process.signal_stop()?;

        let code = match tokio::time::timeout(self.settings.stop_timeout, process.wait()).await {
            Ok(code) => code?,
            Err(_) => {
                tracing::warn!(
                    "Service {} did not stop within {:?}, killing it",
                    self.display_id(),
                    self.settings.stop_timeout
                );
                process.kill()?;
                tokio::time::timeout(self.settings.stop_timeout, process.wait())
                    .await
                    .map_err(|_| {
                        DeployError::Timeout(format!(
                            "service {} still running {:?} after kill",
                            self.display_id(),
                            self.settings.stop_timeout
                        ))
                    })??
            }
        };

        self.record_exit(&process, code).await;
        self.exit_code().await
    }

    /// Launch configuration built from the resolved ports
    pub fn launch_config(&self) -> LaunchConfig {
        let args = match &self.kind {
            ServiceKind::ManagedCrate(spec) => spec.args.clone(),
            ServiceKind::External(_) => Vec::new(),
        };

        let mut config = LaunchConfig::new(self.display_id()).with_args(args);
        for port in self.ports() {
            if let Some(resolved) = port.config() {
                config = config.with_port(port.name(), resolved.clone());
            }
        }
        config
    }

    /// Launch the service through `launcher` and start watching for its exit.
    /// External services have nothing to launch.
    pub(crate) async fn launch(self: &Arc<Self>, launcher: &dyn Launcher, scheduler: &Scheduler) -> Result<bool> {
        let ServiceKind::ManagedCrate(spec) = &self.kind else {
            return Ok(false);
        };

        let attempt = async {
            for port in self.ports() {
                port.release_servers()?;
            }
            let launch = LaunchSpec {
                service: self.id,
                display_id: self.display_id().to_string(),
                host: self.host.clone(),
                spec: spec.clone(),
                config: self.launch_config(),
            };
            launcher.launch(&launch, scheduler).await
        };

        match attempt.await {
            Ok(process) => {
                self.runtime.mark_running(process)?;
                let service = self.clone();
                scheduler.spawn_cancellable(async move { service.watch_exit().await });
                Ok(true)
            }
            Err(e) => {
                tracing::error!("Failed to launch service {}: {}", self.display_id(), e);
                self.runtime.mark_launch_failed(&e.to_string());
                Err(e)
            }
        }
    }

    async fn watch_exit(&self) -> Result<i32> {
        let process = self.process()?.clone();
        let code = match process.wait().await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!("Failed to wait for service {}: {}", self.display_id(), e);
                -1
            }
        };
        self.record_exit(&process, code).await;
        Ok(code)
    }

    async fn record_exit(&self, process: &Arc<dyn LaunchedProcess>, code: i32) {
        if self.runtime.mark_exited(code) {
            tracing::info!("Service {} exited with code {}", self.display_id(), code);
        }

        for log in [process.stdout(), process.stderr()] {
            let drained =
                tokio::time::timeout(self.settings.output_drain_interval, log.wait_closed()).await;
            if drained.is_err() {
                tracing::debug!(
                    "Closing {} of {} after drain interval",
                    log.channel(),
                    self.display_id()
                );
            }
            log.close().await;
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) on {}", self.name, self.kind.label(), self.host)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host.name())
            .field("kind", &self.kind)
            .field("runtime", &self.runtime)
            .finish()
    }
}
