//! Runtime record of a launched service

use crate::error::{DeployError, Result};
use crate::launch::LaunchedProcess;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Service instance state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Not launched yet
    #[default]
    Unlaunched,
    /// Process is running
    Running,
    /// Process exited with a code
    Exited(i32),
    /// The launch capability failed
    LaunchFailed(String),
}

impl ServiceState {
    /// Whether the state can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Exited(_) | ServiceState::LaunchFailed(_))
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Unlaunched => write!(f, "unlaunched"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Exited(code) => write!(f, "exited ({})", code),
            ServiceState::LaunchFailed(reason) => write!(f, "launch failed: {}", reason),
        }
    }
}

/// State of one service instance. The lifecycle driver writes, callers read.
pub struct RuntimeRecord {
    /// Current state
    state: watch::Sender<ServiceState>,
    /// Launched process handle
    process: OnceLock<Arc<dyn LaunchedProcess>>,
    /// Launch timestamp
    launched_at: OnceLock<DateTime<Utc>>,
    /// Exit timestamp
    exited_at: OnceLock<DateTime<Utc>>,
}

impl Default for RuntimeRecord {
    fn default() -> Self {
        let (state, _) = watch::channel(ServiceState::Unlaunched);
        Self {
            state,
            process: OnceLock::new(),
            launched_at: OnceLock::new(),
            exited_at: OnceLock::new(),
        }
    }
}

impl RuntimeRecord {
    /// Create an unlaunched record
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    /// Launched process, if any
    pub fn process(&self) -> Option<&Arc<dyn LaunchedProcess>> {
        self.process.get()
    }

    /// Launch timestamp
    pub fn launched_at(&self) -> Option<DateTime<Utc>> {
        self.launched_at.get().copied()
    }

    /// Exit timestamp
    pub fn exited_at(&self) -> Option<DateTime<Utc>> {
        self.exited_at.get().copied()
    }

    /// Record a successful launch. Only valid from `Unlaunched`.
    pub fn mark_running(&self, process: Arc<dyn LaunchedProcess>) -> Result<()> {
        if self.process.set(process).is_err() {
            return Err(DeployError::Internal("service already launched".to_string()));
        }
        let _ = self.launched_at.set(Utc::now());
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Unlaunched {
                *state = ServiceState::Running;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Record a failed launch
    pub fn mark_launch_failed(&self, reason: &str) {
        self.state.send_if_modified(|state| {
            if *state == ServiceState::Unlaunched {
                *state = ServiceState::LaunchFailed(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    /// Record the exit code. The first recorded code wins.
    pub fn mark_exited(&self, code: i32) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ServiceState::Running {
                *state = ServiceState::Exited(code);
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.exited_at.set(Utc::now());
        }
        changed
    }

    /// Wait until the state is terminal and return it
    pub async fn wait_terminal(&self) -> ServiceState {
        let mut state = self.state.subscribe();
        let result = state.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }
}

impl fmt::Debug for RuntimeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRecord")
            .field("state", &self.state())
            .field("launched_at", &self.launched_at())
            .field("exited_at", &self.exited_at())
            .finish()
    }
}
