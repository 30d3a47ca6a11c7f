//! Integration tests for host supervision.
//!
//! Most tests use the mock spawner. The `process` module runs small shell
//! scripts as fake host binaries and only builds on unix.

use std::sync::Arc;
use std::time::Duration;

use funchost_core::{HostLayout, HostVariant, LaunchRequest, LaunchState, LaunchTracker, WorkerRuntime};
use funchost_runner::{
    contains, ExitReason, HandlerSink, LogLine, LogStream, MockResponse, MockSpawner,
    ProcessSupervisor, ReadyStatus, RunnerError, SupervisorConfig, WatchOutcome,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn fake_layout(variant: HostVariant) -> (TempDir, HostLayout) {
    let temp = TempDir::new().unwrap();
    let layout = HostLayout::new(temp.path());
    let exe = layout.executable_for(variant);
    std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
    std::fs::write(&exe, "").unwrap();
    (temp, layout)
}

fn checked_tracker() -> LaunchTracker {
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

fn fast_config() -> SupervisorConfig {
    SupervisorConfig::new()
        .ready_timeout(Duration::from_secs(5))
        .grace_period(Duration::from_millis(500))
        .drain_timeout(Duration::from_millis(500))
}

/// Test that the readiness marker is detected and the host keeps running.
#[tokio::test]
async fn test_ready_marker_detected() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let spawner = MockSpawner::new().add_response(
        MockResponse::running()
            .stdout_line("Found the following functions:")
            .stdout_line("Job host started"),
    );
    let supervisor = ProcessSupervisor::new(Arc::new(spawner), fast_config());
    let request = LaunchRequest::new(WorkerRuntime::DotnetIsolated, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let handle = tokio::spawn(process.run(cancel));

    tokio::time::sleep(Duration::from_millis(200)).await;
    stopper.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.ready, ReadyStatus::Detected);
    assert_eq!(report.reason, ExitReason::StoppedByUser);
    assert_eq!(report.final_state, LaunchState::StoppedByUser);
    assert!(report.success());
    assert!(report.stderr_tail.is_empty());
}

/// Test that the spawner receives the arguments and environment of the request.
#[tokio::test]
async fn test_spawn_receives_request() {
    let (_temp, layout) = fake_layout(HostVariant::InProc8);
    let spawner = MockSpawner::new();
    let supervisor = ProcessSupervisor::new(Arc::new(spawner.clone()), fast_config());
    let request = LaunchRequest::new(WorkerRuntime::Dotnet, HostVariant::InProc8, "/app")
        .with_port(7090)
        .with_passthrough(vec!["--cors".to_string(), "*".to_string()]);
    let mut tracker = checked_tracker();

    let mut process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    process.stop().await.unwrap();

    let call = spawner.last_call().unwrap();
    assert_eq!(call.program, layout.executable_for(HostVariant::InProc8));
    assert_eq!(call.args, vec!["start", "--port", "7090", "--no-build", "--cors", "*"]);
    assert_eq!(call.env["FUNCTIONS_WORKER_RUNTIME"], "dotnet");
    assert_eq!(call.env["FUNCTIONS_INPROC_NET8_ENABLED"], "1");
    assert_eq!(call.env["AZURE_FUNCTIONS_ENVIRONMENT"], "Development");
}

/// Test that a spawn failure is fatal and reported as a runtime error.
#[tokio::test]
async fn test_spawn_failure_is_not_retried() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let spawner = MockSpawner::new().simulate_failure("permission denied");
    let supervisor = ProcessSupervisor::new(Arc::new(spawner.clone()), fast_config());
    let request = LaunchRequest::new(WorkerRuntime::Node, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let err = supervisor.start(&request, &layout, &mut tracker).await.err().unwrap();

    assert!(matches!(err, RunnerError::SpawnFailed { .. }));
    assert_eq!(spawner.call_count(), 1);
}

/// Test that the maximum run duration stops the host and is reported as such.
#[tokio::test]
async fn test_max_run_duration() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let spawner = MockSpawner::new().add_response(MockResponse::running().stdout_line("Job host started"));
    let supervisor = ProcessSupervisor::new(
        Arc::new(spawner),
        fast_config().max_run_duration(Some(Duration::from_millis(100))),
    );
    let request = LaunchRequest::new(WorkerRuntime::Python, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    let report = process.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.reason, ExitReason::KilledByTimeout);
    assert_eq!(report.final_state, LaunchState::KilledByTimeout);
    assert!(!report.success());
}

/// Test that stopping the host resolves pending watchers.
#[tokio::test]
async fn test_stop_resolves_watchers() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let supervisor = ProcessSupervisor::new(Arc::new(MockSpawner::new()), fast_config());
    let request = LaunchRequest::new(WorkerRuntime::Custom, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let mut process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    let mut subscription = process.subscribe();
    let token = process.watcher_token();
    let watcher = tokio::spawn(async move {
        funchost_runner::LogWatcher::wait_for(
            &mut subscription,
            contains("never printed"),
            Duration::from_secs(60),
            &token,
        )
        .await
    });

    process.stop().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, WatchOutcome::Cancelled);
}

/// Test that a burst of output after the marker does not hide readiness.
#[tokio::test]
async fn test_ready_marker_survives_output_burst() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let mut response = MockResponse::running().stdout_line("Job host started");
    for i in 0..1500 {
        response = response.stdout_line(format!("request {}", i));
    }
    let supervisor = ProcessSupervisor::new(Arc::new(MockSpawner::new().add_response(response)), fast_config());
    let request = LaunchRequest::new(WorkerRuntime::Node, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let handle = tokio::spawn(process.run(cancel));
    tokio::time::sleep(Duration::from_millis(200)).await;
    stopper.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.ready, ReadyStatus::Detected);
    assert_eq!(report.reason, ExitReason::StoppedByUser);
}

/// Test that stopping a host that ignores termination resolves watchers
/// before the grace period runs out.
#[tokio::test]
async fn test_stop_resolves_watchers_before_kill() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let spawner = MockSpawner::new().add_response(MockResponse::running().ignoring_terminate());
    let supervisor = ProcessSupervisor::new(
        Arc::new(spawner),
        fast_config().grace_period(Duration::from_secs(2)),
    );
    let request = LaunchRequest::new(WorkerRuntime::Java, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let mut process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    let mut subscription = process.subscribe();
    let token = process.watcher_token();
    let watcher = tokio::spawn(async move {
        funchost_runner::LogWatcher::wait_for(
            &mut subscription,
            contains("never printed"),
            Duration::from_secs(60),
            &token,
        )
        .await
    });

    let stopping = tokio::spawn(async move { process.stop().await });
    let outcome = tokio::time::timeout(Duration::from_millis(500), watcher)
        .await
        .expect("watcher still pending during the grace period")
        .unwrap();
    assert_eq!(outcome, WatchOutcome::Cancelled);
    assert!(!stopping.is_finished());

    let code = stopping.await.unwrap().unwrap();
    assert_eq!(code, None);
}

/// Test that a failed wait still kills the host, resolves watchers and
/// produces a report.
#[tokio::test]
async fn test_wait_failure_still_stops_host() {
    let (_temp, layout) = fake_layout(HostVariant::Default);
    let spawner =
        MockSpawner::new().add_response(MockResponse::running().failing_wait("no child process"));
    let supervisor = ProcessSupervisor::new(Arc::new(spawner), fast_config());
    let request = LaunchRequest::new(WorkerRuntime::Python, HostVariant::Default, "/app");
    let mut tracker = checked_tracker();

    let process = supervisor.start(&request, &layout, &mut tracker).await.unwrap();
    let mut subscription = process.subscribe();
    let token = process.watcher_token();
    let watcher = tokio::spawn(async move {
        funchost_runner::LogWatcher::wait_for(
            &mut subscription,
            contains("never printed"),
            Duration::from_secs(60),
            &token,
        )
        .await
    });

    let report = tokio::time::timeout(Duration::from_secs(5), process.run(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.reason, ExitReason::ExitedOnItsOwn);
    assert_eq!(report.exit_code, None);
    assert!(!report.success());

    let outcome = tokio::time::timeout(Duration::from_secs(1), watcher)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, WatchOutcome::Cancelled | WatchOutcome::StreamClosed));
}

#[cfg(unix)]
mod process {
    use std::net::{Ipv4Addr, TcpListener};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use funchost_core::PortChecker;
    use funchost_runner::TokioSpawner;

    use super::*;

    /// Serializes script creation and spawning so that no fork inherits a
    /// script that is still open for writing.
    static SPAWN_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn write_host_script(layout: &HostLayout, variant: HostVariant, body: &str) {
        let exe = layout.executable_for(variant);
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn collector() -> (Arc<HandlerSink>, Arc<Mutex<Vec<LogLine>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink = HandlerSink::new(Arc::new(move |line: LogLine| captured.lock().push(line)));
        (Arc::new(sink), lines)
    }

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn start_script(
        body: &str,
        config: SupervisorConfig,
        sink: Arc<HandlerSink>,
        project: &Path,
        port: u16,
    ) -> (TempDir, funchost_runner::SupervisedProcess) {
        let temp = TempDir::new().unwrap();
        let layout = HostLayout::new(temp.path());
        let supervisor = ProcessSupervisor::new(Arc::new(TokioSpawner::new()), config).with_sink(sink);
        let request = LaunchRequest::new(WorkerRuntime::DotnetIsolated, HostVariant::Default, project)
            .with_port(port);
        let mut tracker = checked_tracker();

        let process = {
            let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            write_host_script(&layout, HostVariant::Default, body);
            supervisor.start(&request, &layout, &mut tracker).await.unwrap()
        };
        (temp, process)
    }

    /// Binds the port given after `--port` and serves until SIGTERM.
    const LISTENING_HOST: &str = r#"
echo "Worker process started and initialized"
echo "warming up" >&2
exec perl -MIO::Socket::INET -e '
$| = 1;
my $server = IO::Socket::INET->new(LocalAddr => "127.0.0.1", LocalPort => $ARGV[0], Listen => 5, ReuseAddr => 1)
    or die "bind failed: $!\n";
$SIG{TERM} = sub { print "stopping\n"; exit 0 };
print "Job host started\n";
sleep 1 while 1;
' "$3""#;

    fn perl_available() -> bool {
        std::process::Command::new("perl")
            .arg("-v")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Test readiness detection and a graceful stop of a host that holds its
    /// port, which must be free again once `run` returns.
    #[tokio::test]
    async fn test_real_host_ready_and_stop() {
        if !perl_available() {
            eprintln!("perl not found, skipping listening host test");
            return;
        }
        let project = TempDir::new().unwrap();
        let port = free_port();
        let (sink, lines) = collector();
        let (_layout, process) =
            start_script(LISTENING_HOST, fast_config(), sink, project.path(), port).await;

        let ready = process
            .wait_for(contains("Job host started"), Duration::from_secs(10))
            .await;
        assert!(ready.is_found());
        assert!(!PortChecker::is_available(port));

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let run = tokio::spawn(process.run(cancel));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!PortChecker::is_available(port));
        stopper.cancel();

        let report = run.await.unwrap().unwrap();
        assert!(PortChecker::is_available(port));
        assert_eq!(report.reason, ExitReason::StoppedByUser);
        assert_eq!(report.ready, ReadyStatus::Detected);
        assert_eq!(report.exit_code, Some(0));

        let lines = lines.lock();
        assert!(lines
            .iter()
            .any(|l| l.stream == LogStream::Stderr && l.message == "warming up"));
        assert!(lines.iter().any(|l| l.message == "stopping"));
    }

    /// Test that the child runs in the project directory with the request environment.
    #[tokio::test]
    async fn test_real_host_environment() {
        let project = TempDir::new().unwrap();
        let (sink, lines) = collector();
        let body = r#"
echo "cwd=$(pwd)"
echo "runtime=$FUNCTIONS_WORKER_RUNTIME"
echo "env=$AZURE_FUNCTIONS_ENVIRONMENT"
echo "args=$*"
exit 0"#;
        let (_layout, process) = start_script(body, fast_config(), sink, project.path(), 7123).await;

        let report = process.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.reason, ExitReason::ExitedOnItsOwn);
        assert!(report.success());

        let messages: Vec<String> = lines.lock().iter().map(|l| l.message.clone()).collect();
        let cwd = project.path().canonicalize().unwrap();
        assert!(messages.contains(&format!("cwd={}", cwd.display())));
        assert!(messages.contains(&"runtime=dotnet-isolated".to_string()));
        assert!(messages.contains(&"env=Development".to_string()));
        assert!(messages.contains(&"args=start --port 7123".to_string()));
    }

    /// Test that non-ASCII output survives and invalid bytes are replaced.
    #[tokio::test]
    async fn test_real_host_encoding() {
        let project = TempDir::new().unwrap();
        let (sink, lines) = collector();
        let body = r#"
echo "こんにちは"
printf 'bad \377 byte\r\n'
exit 0"#;
        let (_layout, process) = start_script(body, fast_config(), sink, project.path(), 7124).await;

        process.run(CancellationToken::new()).await.unwrap();

        let messages: Vec<String> = lines.lock().iter().map(|l| l.message.clone()).collect();
        assert!(messages.contains(&"こんにちは".to_string()));
        assert!(messages.contains(&"bad \u{fffd} byte".to_string()));
    }

    /// Test that a host ignoring SIGTERM is killed after the grace period.
    #[tokio::test]
    async fn test_real_host_killed_after_grace() {
        let project = TempDir::new().unwrap();
        let (sink, _lines) = collector();
        let body = r#"
trap '' TERM
echo "Job host started"
while true; do sleep 0.1; done"#;
        let config = fast_config()
            .grace_period(Duration::from_millis(300))
            .max_run_duration(Some(Duration::from_millis(300)));
        let (_layout, process) = start_script(body, config, sink, project.path(), 7125).await;

        let report = process.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.reason, ExitReason::KilledByTimeout);
        assert_eq!(report.exit_code, None);
    }

    /// Test that an abnormal exit carries the stderr tail.
    #[tokio::test]
    async fn test_real_host_crash_report() {
        let project = TempDir::new().unwrap();
        let (sink, _lines) = collector();
        let body = r#"
echo "Starting"
echo "System.InvalidOperationException: boom" >&2
exit 3"#;
        let (_layout, process) = start_script(body, fast_config(), sink, project.path(), 7126).await;

        let report = process.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.exit_code, Some(3));
        assert!(!report.success());
        assert_eq!(report.stderr_tail, vec!["System.InvalidOperationException: boom"]);
    }
}
