//! Mock host spawner for testing.
//!
//! Provides a configurable [`HostSpawner`] that never creates an OS process.
//! Each spawn replays scripted output and exits according to its
//! [`MockResponse`], so supervision can be tested without host binaries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RunnerError, RunnerResult};
use crate::spawner::{HostCommand, HostHandle, HostSpawner, SpawnedHost};

/// When a mock host exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockExit {
    /// Exit with the given code after the delay.
    After(Duration, i32),
    /// Keep running until terminated or killed.
    WhenStopped,
}

/// Scripted behavior for one spawned mock host.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit: MockExit,
    /// Ignore graceful termination, forcing a kill.
    pub ignore_terminate: bool,
    /// Fail every wait until the host is killed.
    pub wait_error: Option<String>,
}

impl MockResponse {
    /// A host that runs until stopped.
    pub fn running() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: MockExit::WhenStopped,
            ignore_terminate: false,
            wait_error: None,
        }
    }

    /// A host that exits on its own.
    pub fn exits(code: i32, after: Duration) -> Self {
        Self {
            exit: MockExit::After(after, code),
            ..Self::running()
        }
    }

    pub fn stdout_line(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    pub fn stderr_line(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }

    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    pub fn failing_wait(mut self, message: impl Into<String>) -> Self {
        self.wait_error = Some(message.into());
        self
    }
}

impl Default for MockResponse {
    fn default() -> Self {
        Self::running()
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

/// Mock spawner for testing.
///
/// Captures every spawn request and returns scripted hosts, allowing tests to
/// verify launch behavior without running real processes.
#[derive(Clone)]
pub struct MockSpawner {
    /// Predefined responses, used in order and then cycled.
    responses: Arc<RwLock<Vec<MockResponse>>>,
    /// Index of next response to return.
    response_index: Arc<AtomicUsize>,
    /// Captured calls for verification.
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// Simulated spawn failure message.
    simulate_failure: Arc<RwLock<Option<String>>>,
    next_pid: Arc<AtomicU32>,
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpawner {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            simulate_failure: Arc::new(RwLock::new(None)),
            next_pid: Arc::new(AtomicU32::new(4000)),
        }
    }

    /// Add a mock response for the next spawn.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Make every spawn fail.
    pub fn simulate_failure(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Number of spawn attempts.
    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    pub fn last_call(&self) -> Option<CapturedCall> {
        self.captured_calls.read().last().cloned()
    }

    fn next_response(&self) -> MockResponse {
        let responses = self.responses.read();
        if responses.is_empty() {
            return MockResponse::running();
        }
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index % responses.len())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostSpawner for MockSpawner {
    async fn spawn(&self, command: &HostCommand) -> RunnerResult<SpawnedHost> {
        self.captured_calls.write().push(CapturedCall {
            program: command.program.clone(),
            args: command.args.clone(),
            env: command.env.clone(),
            working_dir: command.working_dir.clone(),
        });

        if let Some(msg) = self.simulate_failure.read().clone() {
            return Err(RunnerError::SpawnFailed {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, msg),
            });
        }

        let response = self.next_response();
        let exited = CancellationToken::new();
        let (mut out_writer, out_reader) = tokio::io::duplex(64 * 1024);
        let (mut err_writer, err_reader) = tokio::io::duplex(64 * 1024);

        let script = response.clone();
        let done = exited.clone();
        tokio::spawn(async move {
            for line in &script.stdout {
                let _ = out_writer.write_all(format!("{}\n", line).as_bytes()).await;
            }
            for line in &script.stderr {
                let _ = err_writer.write_all(format!("{}\n", line).as_bytes()).await;
            }
            // Pipes close when the host exits.
            done.cancelled().await;
        });

        let handle = MockHandle {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            deadline: match response.exit {
                MockExit::After(delay, code) => Some((Instant::now() + delay, code)),
                MockExit::WhenStopped => None,
            },
            ignore_terminate: response.ignore_terminate,
            wait_error: response.wait_error,
            terminate_requested: CancellationToken::new(),
            kill_requested: CancellationToken::new(),
            exited,
            exit_code: None,
        };

        Ok(SpawnedHost {
            handle: Box::new(handle),
            stdout: Box::new(out_reader),
            stderr: Box::new(err_reader),
        })
    }
}

struct MockHandle {
    pid: u32,
    deadline: Option<(Instant, i32)>,
    ignore_terminate: bool,
    wait_error: Option<String>,
    terminate_requested: CancellationToken,
    kill_requested: CancellationToken,
    exited: CancellationToken,
    exit_code: Option<Option<i32>>,
}

#[async_trait]
impl HostHandle for MockHandle {
    fn id(&self) -> Option<u32> {
        if self.exit_code.is_some() {
            None
        } else {
            Some(self.pid)
        }
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        if let Some(msg) = &self.wait_error {
            if !self.kill_requested.is_cancelled() {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, msg.clone()));
            }
        }

        let deadline = self.deadline;
        let natural_exit = async move {
            match deadline {
                Some((at, code)) => {
                    tokio::time::sleep_until(at).await;
                    code
                }
                None => std::future::pending().await,
            }
        };

        let code = tokio::select! {
            _ = self.kill_requested.cancelled() => None,
            _ = self.terminate_requested.cancelled(), if !self.ignore_terminate => Some(0),
            code = natural_exit => Some(code),
        };

        self.exit_code = Some(code);
        self.exited.cancel();
        Ok(code)
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.terminate_requested.cancel();
        Ok(())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.kill_requested.cancel();
        self.wait().await.map(|_| ())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.exited.cancel();
    }
}
