//! Host process supervision.
//!
//! [`ProcessSupervisor::start`] resolves the host binary, spawns it and hands
//! both output pipes to a [`StreamMultiplexer`] before anything else happens.
//! [`SupervisedProcess::run`] then waits for readiness and for one of three
//! endings: the caller cancels, the maximum run duration passes, or the host
//! exits by itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use funchost_core::{HostLayout, LaunchRequest, LaunchState, LaunchTracker};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::RunnerResult;
use crate::log::LogLine;
use crate::multiplexer::{LogSubscription, StreamMultiplexer};
use crate::sink::LogSink;
use crate::spawner::{HostCommand, HostHandle, HostSpawner};
use crate::watcher::{contains, LogWatcher, ReadyStatus, WatchOutcome};

/// Terminal flag of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited by itself or after a graceful termination.
    Exited,
    /// Forcefully killed.
    Killed,
}

/// Why supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StoppedByUser,
    KilledByTimeout,
    ExitedOnItsOwn,
}

impl ExitReason {
    fn launch_state(&self) -> LaunchState {
        match self {
            Self::StoppedByUser => LaunchState::StoppedByUser,
            Self::KilledByTimeout => LaunchState::KilledByTimeout,
            Self::ExitedOnItsOwn => LaunchState::ExitedOnItsOwn,
        }
    }
}

/// Summary of one supervised run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitReport {
    pub launch_id: Uuid,
    pub reason: ExitReason,
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub ready: ReadyStatus,
    pub final_state: LaunchState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Last stderr lines, filled in for abnormal endings.
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    /// Stopped on request, or exited by itself with code 0.
    pub fn success(&self) -> bool {
        match self.reason {
            ExitReason::StoppedByUser => true,
            ExitReason::ExitedOnItsOwn => self.exit_code == Some(0),
            ExitReason::KilledByTimeout => false,
        }
    }
}

/// Starts host processes.
pub struct ProcessSupervisor {
    spawner: Arc<dyn HostSpawner>,
    config: SupervisorConfig,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl ProcessSupervisor {
    pub fn new(spawner: Arc<dyn HostSpawner>, config: SupervisorConfig) -> Self {
        Self {
            spawner,
            config,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn the host for `request`.
    ///
    /// A missing host binary is reported before any spawn attempt, and the
    /// tracker is moved to `RejectedBeforeLaunch`.
    pub async fn start(
        &self,
        request: &LaunchRequest,
        layout: &HostLayout,
        tracker: &mut LaunchTracker,
    ) -> RunnerResult<SupervisedProcess> {
        let program = match layout.locate(request.variant) {
            Ok(path) => path,
            Err(e) => {
                tracker.reject(e.kind());
                return Err(e.into());
            }
        };

        let command = HostCommand::from_request(request, program);
        info!("Starting {} host: {}", request.variant, command.display());

        let spawned = self.spawner.spawn(&command).await?;
        let multiplexer = StreamMultiplexer::attach(
            spawned.stdout,
            spawned.stderr,
            self.sinks.clone(),
            self.config.ring_capacity,
        );
        let ready_subscription = multiplexer.subscribe_with_backlog();
        tracker.advance(LaunchState::Spawned)?;

        let pid = spawned.handle.id();
        debug!("Host process started with pid {:?}", pid);

        Ok(SupervisedProcess {
            launch_id: request.id,
            pid,
            handle: spawned.handle,
            multiplexer,
            ready_subscription: Some(ready_subscription),
            watchers: CancellationToken::new(),
            state: ProcessState::Running,
            exit_code: None,
            ready: ReadyStatus::Unknown,
            tracker: tracker.clone(),
            config: self.config.clone(),
            started_at: Utc::now(),
        })
    }
}

/// A running host process and its output.
pub struct SupervisedProcess {
    launch_id: Uuid,
    pid: Option<u32>,
    handle: Box<dyn HostHandle>,
    multiplexer: StreamMultiplexer,
    ready_subscription: Option<LogSubscription>,
    /// Cancelled on termination. Resolves every pending watcher.
    watchers: CancellationToken,
    state: ProcessState,
    exit_code: Option<i32>,
    ready: ReadyStatus,
    tracker: LaunchTracker,
    config: SupervisorConfig,
    started_at: DateTime<Utc>,
}

impl SupervisedProcess {
    pub fn launch_id(&self) -> Uuid {
        self.launch_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn launch_state(&self) -> &LaunchState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &LaunchTracker {
        &self.tracker
    }

    /// New subscription to host output, starting with buffered lines.
    pub fn subscribe(&self) -> LogSubscription {
        self.multiplexer.subscribe_with_backlog()
    }

    /// Token cancelled when the process is terminated.
    pub fn watcher_token(&self) -> CancellationToken {
        self.watchers.clone()
    }

    pub fn recent_lines(&self) -> Vec<LogLine> {
        self.multiplexer.recent_lines()
    }

    /// Wait for a line matching `predicate`. Resolves `Cancelled` once the
    /// process is stopped.
    pub async fn wait_for<P>(&self, predicate: P, timeout: Duration) -> WatchOutcome
    where
        P: Fn(&LogLine) -> bool,
    {
        let mut subscription = self.subscribe();
        LogWatcher::wait_for(&mut subscription, predicate, timeout, &self.watchers).await
    }

    /// Supervise until `cancel` fires, the run duration policy expires or the
    /// host exits. The host is always stopped when this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> RunnerResult<ExitReport> {
        let supervised = self.supervise(&cancel).await;
        if let Err(e) = self.stop().await {
            error!("Failed to stop host process: {}", e);
        }
        let reason = supervised?;
        self.finish(reason).await
    }

    async fn supervise(&mut self, cancel: &CancellationToken) -> RunnerResult<ExitReason> {
        let mut subscription = match self.ready_subscription.take() {
            Some(subscription) => subscription,
            None => self.multiplexer.subscribe_with_backlog(),
        };
        let watchers = self.watchers.clone();
        let marker = self.config.ready_marker.clone();
        let ready_timeout = self.config.ready_timeout;
        let readiness = async move {
            LogWatcher::wait_for(&mut subscription, contains(marker), ready_timeout, &watchers).await
        };
        tokio::pin!(readiness);

        let max_run = self.config.max_run_duration;
        let policy_deadline = async move {
            match max_run {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(policy_deadline);

        let mut readiness_pending = true;
        let reason = loop {
            tokio::select! {
                outcome = &mut readiness, if readiness_pending => {
                    readiness_pending = false;
                    if self.on_readiness(&outcome)? {
                        break ExitReason::KilledByTimeout;
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Stop requested, shutting down host");
                    break ExitReason::StoppedByUser;
                }
                _ = &mut policy_deadline => {
                    warn!("Host reached the maximum run duration, shutting down");
                    break ExitReason::KilledByTimeout;
                }
                status = self.handle.wait() => {
                    match status {
                        Ok(code) => {
                            self.state = ProcessState::Exited;
                            self.exit_code = code;
                        }
                        // Still marked running, so stop() kills it.
                        Err(e) => warn!("Failed to wait for host process: {}", e),
                    }
                    break ExitReason::ExitedOnItsOwn;
                }
            }
        };
        Ok(reason)
    }

    /// Returns true when the readiness policy requires stopping the host.
    fn on_readiness(&mut self, outcome: &WatchOutcome) -> RunnerResult<bool> {
        self.ready = ReadyStatus::from(outcome);
        match outcome {
            WatchOutcome::Found(_) => {
                info!("Host is ready");
                self.tracker.advance(LaunchState::ReadyDetected)?;
                self.tracker.advance(LaunchState::Running)?;
                Ok(false)
            }
            WatchOutcome::TimedOut => {
                warn!(
                    "Host did not report '{}' within {:?}",
                    self.config.ready_marker, self.config.ready_timeout
                );
                self.tracker.advance(LaunchState::ReadyTimedOut)?;
                if self.config.fail_on_ready_timeout {
                    return Ok(true);
                }
                self.tracker.advance(LaunchState::Running)?;
                Ok(false)
            }
            // The exit branch reports these.
            WatchOutcome::StreamClosed | WatchOutcome::Cancelled => Ok(false),
        }
    }

    /// Stop the host: graceful termination first, a kill after the grace
    /// period. Safe to call more than once.
    pub async fn stop(&mut self) -> RunnerResult<Option<i32>> {
        self.watchers.cancel();
        if matches!(self.state, ProcessState::Exited | ProcessState::Killed) {
            return Ok(self.exit_code);
        }

        debug!("Sending termination signal to host {:?}", self.pid);
        if let Err(e) = self.handle.terminate() {
            warn!("Failed to signal host process: {}", e);
        }

        match tokio::time::timeout(self.config.grace_period, self.handle.wait()).await {
            Ok(Ok(code)) => {
                self.exit_code = code;
                self.state = ProcessState::Exited;
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for host process, killing it: {}", e);
                self.force_kill().await?;
            }
            Err(_) => {
                warn!(
                    "Host did not exit within {:?}, killing it",
                    self.config.grace_period
                );
                self.force_kill().await?;
            }
        }

        Ok(self.exit_code)
    }

    async fn force_kill(&mut self) -> RunnerResult<()> {
        self.exit_code = None;
        self.state = ProcessState::Killed;
        self.handle.kill().await?;
        Ok(())
    }

    async fn finish(mut self, reason: ExitReason) -> RunnerResult<ExitReport> {
        self.multiplexer.shutdown(self.config.drain_timeout).await;
        self.tracker.advance(reason.launch_state())?;

        let finished_at = Utc::now();
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        let mut report = ExitReport {
            launch_id: self.launch_id,
            reason,
            exit_code: self.exit_code,
            ready: self.ready,
            final_state: self.tracker.state().clone(),
            started_at: self.started_at,
            finished_at,
            duration_ms,
            stderr_tail: Vec::new(),
        };

        if report.success() {
            info!("Host stopped after {}ms", duration_ms);
        } else {
            report.stderr_tail = self.multiplexer.stderr_tail(self.config.stderr_tail_lines);
            error!(
                "Host ended ({:?}) with exit code {:?} after {}ms",
                reason, report.exit_code, duration_ms
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use funchost_core::{HostVariant, WorkerRuntime, HOST_EXECUTABLE};
    use tempfile::TempDir;

    use super::*;
    use crate::mock::{MockResponse, MockSpawner};

    fn layout_with(variant: HostVariant) -> (TempDir, HostLayout) {
        let temp = TempDir::new().unwrap();
        let layout = HostLayout::new(temp.path());
        let exe = layout.executable_for(variant);
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, "").unwrap();
        assert!(exe.ends_with(HOST_EXECUTABLE));
        (temp, layout)
    }

    fn spawned_tracker() -> LaunchTracker {
        let mut tracker = LaunchTracker::new();
        for state in [
            LaunchState::Resolved,
            LaunchState::VariantSelected,
            LaunchState::ConfigValidated,
            LaunchState::PortChecked,
        ] {
            tracker.advance(state).unwrap();
        }
        tracker
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig::new()
            .ready_timeout(Duration::from_secs(5))
            .grace_period(Duration::from_millis(200))
            .drain_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_missing_binary_rejects_without_spawn() {
        let temp = TempDir::new().unwrap();
        let spawner = MockSpawner::new();
        let supervisor = ProcessSupervisor::new(Arc::new(spawner.clone()), config());
        let request = LaunchRequest::new(WorkerRuntime::Dotnet, HostVariant::InProc8, temp.path());
        let mut tracker = spawned_tracker();

        let err = supervisor
            .start(&request, &HostLayout::new(temp.path()), &mut tracker)
            .await
            .err()
            .unwrap();

        assert!(err.to_string().starts_with("Failed to locate the inproc8 model host at"));
        assert_eq!(spawner.call_count(), 0);
        assert!(matches!(tracker.state(), LaunchState::RejectedBeforeLaunch(_)));
    }

    #[tokio::test]
    async fn test_exits_on_its_own() {
        let (_temp, layout) = layout_with(HostVariant::Default);
        let spawner = MockSpawner::new().add_response(
            MockResponse::exits(2, Duration::from_millis(50))
                .stderr_line("Unhandled exception")
                .stderr_line("Host crashed"),
        );
        let supervisor = ProcessSupervisor::new(Arc::new(spawner), config());
        let request = LaunchRequest::new(WorkerRuntime::Node, HostVariant::Default, "/app");
        let mut tracker = spawned_tracker();

        let process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
        let report = process.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.reason, ExitReason::ExitedOnItsOwn);
        assert_eq!(report.exit_code, Some(2));
        assert!(!report.success());
        assert_eq!(report.final_state, LaunchState::ExitedOnItsOwn);
        assert_eq!(report.stderr_tail, vec!["Unhandled exception", "Host crashed"]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_temp, layout) = layout_with(HostVariant::Default);
        let supervisor = ProcessSupervisor::new(Arc::new(MockSpawner::new()), config());
        let request = LaunchRequest::new(WorkerRuntime::Python, HostVariant::Default, "/app");
        let mut tracker = spawned_tracker();

        let mut process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
        assert_eq!(process.stop().await.unwrap(), Some(0));
        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(process.stop().await.unwrap(), Some(0));
        assert!(process.watcher_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_stubborn_host_is_killed() {
        let (_temp, layout) = layout_with(HostVariant::Default);
        let spawner = MockSpawner::new().add_response(MockResponse::running().ignoring_terminate());
        let supervisor = ProcessSupervisor::new(Arc::new(spawner), config());
        let request = LaunchRequest::new(WorkerRuntime::Java, HostVariant::Default, "/app");
        let mut tracker = spawned_tracker();

        let mut process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
        assert_eq!(process.stop().await.unwrap(), None);
        assert_eq!(process.state(), ProcessState::Killed);
    }

    #[tokio::test]
    async fn test_ready_timeout_policy() {
        let (_temp, layout) = layout_with(HostVariant::Default);
        let spawner = MockSpawner::new().add_response(MockResponse::running().stdout_line("starting"));
        let supervisor = ProcessSupervisor::new(
            Arc::new(spawner),
            config()
                .ready_timeout(Duration::from_millis(50))
                .fail_on_ready_timeout(true),
        );
        let request = LaunchRequest::new(WorkerRuntime::Node, HostVariant::Default, "/app");
        let mut tracker = spawned_tracker();

        let process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
        let report = process.run(CancellationToken::new()).await.unwrap();

        assert_eq!(report.reason, ExitReason::KilledByTimeout);
        assert_eq!(report.ready, ReadyStatus::TimedOut);
    }
}
