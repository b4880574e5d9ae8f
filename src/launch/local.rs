//! Launching crates as local processes

use super::output::{OutputChannel, OutputLog};
use super::{LaunchSpec, LaunchedProcess, Launcher};
use crate::error::{DeployError, Result};
use crate::host::HostKind;
use crate::integration::CONFIG_ENV;
use crate::scheduler::Scheduler;
use crate::service::{CrateSpec, CrateTarget};
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::OnceCell;

/// Build parameters that identify one cargo build
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BuildKey {
    src: PathBuf,
    target: CrateTarget,
    profile: Option<String>,
    features: Vec<String>,
}

impl From<&CrateSpec> for BuildKey {
    fn from(spec: &CrateSpec) -> Self {
        let mut features = spec.features.clone();
        features.sort();
        features.dedup();
        Self {
            src: spec.src.clone(),
            target: spec.target.clone(),
            profile: spec.profile.clone(),
            features,
        }
    }
}

/// Builds crates with cargo and runs them on the local machine. Builds are
/// memoized per build parameters, so services sharing a crate build once.
#[derive(Debug)]
pub struct LocalLauncher {
    /// Cargo executable
    cargo: PathBuf,
    /// Finished and in-flight builds
    builds: Mutex<HashMap<BuildKey, Arc<OnceCell<PathBuf>>>>,
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self {
            cargo: PathBuf::from("cargo"),
            builds: Mutex::new(HashMap::new()),
        }
    }
}

impl LocalLauncher {
    /// Create a launcher using `cargo` from PATH
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific cargo executable
    pub fn cargo(mut self, cargo: impl Into<PathBuf>) -> Self {
        self.cargo = cargo.into();
        self
    }

    /// Build a crate, reusing an earlier build with the same parameters
    pub async fn build(&self, spec: &CrateSpec) -> Result<PathBuf> {
        let cell = {
            let mut builds = self
                .builds
                .lock()
                .map_err(|_| DeployError::Lock("Failed to acquire build cache lock".to_string()))?;
            builds.entry(BuildKey::from(spec)).or_default().clone()
        };

        cell.get_or_try_init(|| build_crate(&self.cargo, spec))
            .await
            .cloned()
    }

    async fn spawn(&self, spec: &LaunchSpec, executable: &Path, scheduler: &Scheduler) -> Result<LocalProcess> {
        let launch_error = |message: String| DeployError::Launch {
            service: spec.display_id.clone(),
            message,
        };

        let config = spec.config.to_json()?;
        let mut child = Command::new(executable)
            .args(&spec.spec.args)
            .env(CONFIG_ENV, &config)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_error(format!("{}: {}", executable.display(), e)))?;

        let pid = child.id();
        tracing::info!("Launched {} (pid {:?})", spec.display_id, pid);

        let mut stdin = child.stdin.take();
        if let Some(stdin) = stdin.as_mut() {
            stdin
                .write_all(format!("{}\n", config).as_bytes())
                .await
                .map_err(|e| launch_error(format!("failed to send launch configuration: {}", e)))?;
            stdin.flush().await?;
        }

        let stdout = Arc::new(OutputLog::new(&spec.display_id, OutputChannel::Stdout));
        let stderr = Arc::new(OutputLog::new(&spec.display_id, OutputChannel::Stderr));

        if let Some(out) = child.stdout.take() {
            scheduler.spawn_cancellable(read_lines(out, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            scheduler.spawn_cancellable(read_lines(err, stderr.clone()));
        }

        Ok(LocalProcess {
            pid,
            child: tokio::sync::Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout,
            stderr,
            exit: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, spec: &LaunchSpec, scheduler: &Scheduler) -> Result<Arc<dyn LaunchedProcess>> {
        if *spec.host.kind() != HostKind::Localhost {
            return Err(DeployError::Launch {
                service: spec.display_id.clone(),
                message: format!("cannot launch on {} with the local launcher", spec.host),
            });
        }

        let executable = self.build(&spec.spec).await?;
        let process = self.spawn(spec, &executable, scheduler).await?;
        Ok(Arc::new(process))
    }
}

async fn read_lines<R>(reader: R, log: Arc<OutputLog>)
where
    R: AsyncRead + Unpin,
{
    // Output is arbitrary bytes, so decode lossily and keep draining until EOF
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log.push(line.trim_end_matches(['\r', '\n']).to_string()).await;
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", log.channel(), e);
                break;
            }
        }
    }
    log.close().await;
}

async fn build_crate(cargo: &Path, spec: &CrateSpec) -> Result<PathBuf> {
    tracing::info!("Building {}", spec.src.display());

    let mut command = Command::new(cargo);
    command
        .arg("build")
        .arg("--message-format=json-render-diagnostics")
        .current_dir(&spec.src)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match &spec.target {
        CrateTarget::Default => {}
        CrateTarget::Bin(name) => {
            command.args(["--bin", name.as_str()]);
        }
        CrateTarget::Example(name) => {
            command.args(["--example", name.as_str()]);
        }
    }
    if let Some(profile) = &spec.profile {
        command.args(["--profile", profile.as_str()]);
    }
    if !spec.features.is_empty() {
        command.arg("--features").arg(spec.features.join(","));
    }

    let output = command
        .output()
        .await
        .map_err(|e| DeployError::Build(format!("failed to run {}: {}", cargo.display(), e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(DeployError::Build(format!(
            "cargo build of {} failed with {}:\n{}",
            spec.src.display(),
            output.status,
            tail.join("\n")
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    find_executable(&stdout, &spec.target)?.ok_or_else(|| {
        DeployError::Build(format!("cargo build of {} produced no executable", spec.src.display()))
    })
}

/// Pick the executable for `target` out of cargo's JSON messages
fn find_executable(messages: &str, target: &CrateTarget) -> Result<Option<PathBuf>> {
    let mut found = None;

    for line in messages.lines().filter(|l| l.starts_with('{')) {
        let message: serde_json::Value = serde_json::from_str(line)?;
        if message["reason"] != "compiler-artifact" {
            continue;
        }
        let Some(executable) = message["executable"].as_str() else {
            continue;
        };

        let name = message["target"]["name"].as_str().unwrap_or_default();
        let kinds: Vec<&str> = message["target"]["kind"]
            .as_array()
            .map(|k| k.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let matches = match target {
            CrateTarget::Default => kinds.contains(&"bin"),
            CrateTarget::Bin(bin) => kinds.contains(&"bin") && name == bin,
            CrateTarget::Example(example) => kinds.contains(&"example") && name == example,
        };
        if matches {
            found = Some(PathBuf::from(executable));
        }
    }

    Ok(found)
}

/// Exit code of a finished process, `128 + signal` when killed by a signal
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// A locally spawned service process
#[derive(Debug)]
struct LocalProcess {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Arc<OutputLog>,
    stderr: Arc<OutputLog>,
    exit: OnceLock<i32>,
}

impl LocalProcess {
    fn send_signal(&self, signal: i32) -> Result<()> {
        if self.exit.get().is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };

        let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl LaunchedProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn stdout(&self) -> Arc<OutputLog> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<OutputLog> {
        self.stderr.clone()
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit.get().copied()
    }

    async fn wait(&self) -> Result<i32> {
        let mut child = self.child.lock().await;
        if let Some(code) = self.exit.get() {
            return Ok(*code);
        }

        let status = child.wait().await?;
        let code = exit_code_of(status);
        let _ = self.exit.set(code);

        if let Ok(mut stdin) = self.stdin.lock() {
            stdin.take();
        }
        Ok(code)
    }

    fn signal_stop(&self) -> Result<()> {
        self.send_signal(libc::SIGTERM)
    }

    fn kill(&self) -> Result<()> {
        self.send_signal(libc::SIGKILL)
    }
}
