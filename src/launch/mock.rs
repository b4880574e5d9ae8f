//! Scripted launcher for lifecycle tests

use super::output::{OutputChannel, OutputLog};
use super::{LaunchSpec, LaunchedProcess, Launcher};
use crate::error::{DeployError, Result};
use crate::integration::LaunchConfig;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// What a mock service does once launched
#[derive(Debug, Clone, Default)]
pub(crate) struct MockScript {
    /// Lines printed on stdout right after launch
    pub stdout: Vec<String>,
    /// Lines printed on stderr right after launch
    pub stderr: Vec<String>,
    /// Exit right away with this code; run until stopped when unset
    pub exit: Option<i32>,
    /// Fail the launch with this message
    pub fail: Option<String>,
    /// Keep running on a stop signal, only a kill ends it
    pub ignore_stop: bool,
    /// Survive kills too
    pub ignore_kill: bool,
}

impl MockScript {
    pub fn exits(code: i32) -> Self {
        Self {
            exit: Some(code),
            ..Self::default()
        }
    }

    pub fn fails(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn stdout(mut self, lines: &[&str]) -> Self {
        self.stdout = lines.iter().map(|l| l.to_string()).collect();
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockLauncher {
    scripts: HashMap<String, MockScript>,
    launched: Mutex<Vec<LaunchConfig>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, display_id: &str, script: MockScript) -> Self {
        self.scripts.insert(display_id.to_string(), script);
        self
    }

    /// Configurations of every launch attempt, in order
    pub fn launched(&self) -> Vec<LaunchConfig> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, spec: &LaunchSpec, _scheduler: &Scheduler) -> Result<Arc<dyn LaunchedProcess>> {
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(spec.config.clone());
        }

        let script = self.scripts.get(&spec.display_id).cloned().unwrap_or_default();
        if let Some(message) = script.fail {
            return Err(DeployError::Launch {
                service: spec.display_id.clone(),
                message,
            });
        }

        let stdout = Arc::new(OutputLog::new(&spec.display_id, OutputChannel::Stdout));
        let stderr = Arc::new(OutputLog::new(&spec.display_id, OutputChannel::Stderr));
        for line in script.stdout {
            stdout.push(line).await;
        }
        for line in script.stderr {
            stderr.push(line).await;
        }

        let (exit, _) = watch::channel(script.exit);
        Ok(Arc::new(MockProcess {
            stdout,
            stderr,
            exit,
            ignore_stop: script.ignore_stop,
            ignore_kill: script.ignore_kill,
        }))
    }
}

#[derive(Debug)]
struct MockProcess {
    stdout: Arc<OutputLog>,
    stderr: Arc<OutputLog>,
    exit: watch::Sender<Option<i32>>,
    ignore_stop: bool,
    ignore_kill: bool,
}

impl MockProcess {
    fn finish(&self, code: i32) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(code);
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl LaunchedProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn stdout(&self) -> Arc<OutputLog> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<OutputLog> {
        self.stderr.clone()
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    async fn wait(&self) -> Result<i32> {
        let mut exit = self.exit.subscribe();
        let code = *exit
            .wait_for(|e| e.is_some())
            .await
            .map_err(|_| DeployError::Internal("mock process dropped".to_string()))?;
        Ok(code.unwrap_or(-1))
    }

    fn signal_stop(&self) -> Result<()> {
        if !self.ignore_stop {
            self.finish(143);
        }
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        if !self.ignore_kill {
            self.finish(137);
        }
        Ok(())
    }
}
