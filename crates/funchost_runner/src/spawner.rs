//! Process creation seam.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use funchost_core::LaunchRequest;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};

/// Fully resolved command line for a host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

impl HostCommand {
    pub fn from_request(request: &LaunchRequest, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: request.host_args(),
            env: request.environment(),
            working_dir: request.working_dir.clone(),
        }
    }

    /// Format command for logging.
    pub fn display(&self) -> String {
        let mut cmd = self.program.display().to_string();
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('=') {
                cmd.push_str(&format!(" '{}'", arg));
            } else {
                cmd.push_str(&format!(" {}", arg));
            }
        }
        cmd
    }
}

/// Control over a running host process.
#[async_trait]
pub trait HostHandle: Send + Sync {
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Returns the exit code, or `None` if killed by a signal.
    ///
    /// Must be cancel safe.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Ask the process to stop (SIGTERM on unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Stop the process forcefully.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly spawned host with its output pipes.
pub struct SpawnedHost {
    pub handle: Box<dyn HostHandle>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

/// Creates host processes.
#[async_trait]
pub trait HostSpawner: Send + Sync {
    async fn spawn(&self, command: &HostCommand) -> RunnerResult<SpawnedHost>;
}

/// Spawns real OS processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostSpawner for TokioSpawner {
    async fn spawn(&self, command: &HostCommand) -> RunnerResult<SpawnedHost> {
        debug!("Executing: {}", command.display());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::SpawnFailed {
                program: command.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(RunnerError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(RunnerError::MissingPipe("stderr"))?;

        Ok(SpawnedHost {
            handle: Box::new(ChildHandle { child }),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl HostHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}
