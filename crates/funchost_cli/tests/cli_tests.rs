//! End-to-end tests for the `funchost` binary.

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Serializes tests that write host scripts and then spawn processes.
static PROCESS_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn funchost(args: &[&str], host_root: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_funchost"))
        .args(args)
        .env("FUNCHOST_HOST_ROOT", host_root)
        .env_remove("FUNCTIONS_WORKER_RUNTIME")
        .env_remove("FUNCTIONS_INPROC_NET8_ENABLED")
        .env_remove("FUNCHOST_MAX_RUN_SECONDS")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run funchost")
}

fn project(host_json: Option<&str>) -> TempDir {
    let dir = TempDir::new().unwrap();
    if let Some(content) = host_json {
        std::fs::write(dir.path().join("host.json"), content).unwrap();
    }
    dir
}

fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// A project without host.json is rejected with exit code 3.
#[test]
fn test_missing_host_json_exits_with_validation_code() {
    let app = project(None);
    let hosts = TempDir::new().unwrap();
    let script_root = app.path().to_str().unwrap();

    let output = funchost(&["start", "--node", "--script-root", script_root], hosts.path());

    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("Host.json file is missing"));
}

/// An unknown variant name is an argument error.
#[test]
fn test_unknown_variant_exits_with_invalid_args_code() {
    let app = project(Some(r#"{"version": "2.0"}"#));
    let hosts = TempDir::new().unwrap();
    let script_root = app.path().to_str().unwrap();

    let output = funchost(
        &["start", "--dotnet", "--runtime", "inproc7", "--script-root", script_root],
        hosts.path(),
    );

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("inproc7"));
}

/// A variant meant for another worker runtime names the valid one.
#[test]
fn test_incompatible_variant_names_valid_runtime() {
    let app = project(Some(r#"{"version": "2.0"}"#));
    let hosts = TempDir::new().unwrap();
    let script_root = app.path().to_str().unwrap();

    let output = funchost(
        &["start", "--dotnet", "--runtime", "default", "--script-root", script_root],
        hosts.path(),
    );

    assert_eq!(output.status.code(), Some(3));
    let err = stderr(&output);
    assert!(err.contains("'default'"));
    assert!(err.contains("dotnet-isolated"));
}

/// A port held by another listener is rejected before anything starts.
#[test]
fn test_port_in_use_exits_with_validation_code() {
    let app = project(Some(r#"{"version": "2.0"}"#));
    let hosts = TempDir::new().unwrap();
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    let script_root = app.path().to_str().unwrap();

    let output = funchost(
        &["start", "--node", "--port", &port, "--script-root", script_root],
        hosts.path(),
    );

    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains(&format!("Port {} is unavailable", port)));
}

/// Dry runs print the host command and environment without spawning.
#[test]
fn test_dry_run_prints_command() {
    let app = project(Some(r#"{"version": "2.0"}"#));
    let hosts = TempDir::new().unwrap();
    let port = free_port().to_string();
    let script_root = app.path().to_str().unwrap();

    let output = funchost(
        &[
            "start", "--node", "--port", &port, "--dry-run", "--script-root", script_root, "--",
            "--cors", "*",
        ],
        hosts.path(),
    );

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("start --port {} --cors *", port)));
    assert!(stdout.contains("out-of-proc"));
    assert!(stdout.contains("FUNCTIONS_WORKER_RUNTIME=node"));
    assert!(stdout.contains("AZURE_FUNCTIONS_ENVIRONMENT=Development"));
}

/// A missing host build is a validation failure.
#[test]
fn test_missing_host_binary_exits_with_validation_code() {
    let app = project(Some(r#"{"version": "2.0"}"#));
    let hosts = TempDir::new().unwrap();
    let port = free_port().to_string();
    let script_root = app.path().to_str().unwrap();

    let output = funchost(
        &["start", "--python", "--port", &port, "--script-root", script_root],
        hosts.path(),
    );

    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("Failed to locate the default model host at"));
}

#[cfg(unix)]
mod process {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn write_host(hosts: &Path, body: &str) {
        let dir = hosts.join("out-of-proc");
        std::fs::create_dir_all(&dir).unwrap();
        let exe = dir.join("func");
        std::fs::write(&exe, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A host that becomes ready and exits with 0 is a success.
    #[test]
    fn test_host_exit_zero_succeeds() {
        let _guard = PROCESS_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let app = project(Some(r#"{"version": "2.0"}"#));
        let hosts = TempDir::new().unwrap();
        write_host(hosts.path(), "echo \"Job host started\"\nsleep 0.2\nexit 0");
        let port = free_port().to_string();
        let script_root = app.path().to_str().unwrap();

        let output = funchost(
            &["start", "--node", "--port", &port, "--script-root", script_root],
            hosts.path(),
        );

        assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
        assert!(String::from_utf8_lossy(&output.stdout).contains("Job host started"));
    }

    /// A crashing host maps to the runtime exit code and reports its stderr.
    #[test]
    fn test_host_crash_exits_with_runtime_code() {
        let _guard = PROCESS_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let app = project(Some(r#"{"version": "2.0"}"#));
        let hosts = TempDir::new().unwrap();
        write_host(hosts.path(), "echo \"Unhandled exception\" >&2\nexit 3");
        let port = free_port().to_string();
        let script_root = app.path().to_str().unwrap();

        let output = funchost(
            &["start", "--node", "--port", &port, "--script-root", script_root],
            hosts.path(),
        );

        assert_eq!(output.status.code(), Some(4));
        let err = stderr(&output);
        assert!(err.contains("Host exited with code 3"));
        assert!(err.contains("Unhandled exception"));
    }

    /// The run duration limit stops a host that never exits.
    #[test]
    fn test_max_run_duration_stops_host() {
        let _guard = PROCESS_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let app = project(Some(r#"{"version": "2.0"}"#));
        let hosts = TempDir::new().unwrap();
        write_host(
            hosts.path(),
            "echo \"Job host started\"\ntrap 'exit 0' TERM\nwhile true; do sleep 0.1; done",
        );
        let port = free_port().to_string();
        let report = app.path().join("report.json");
        let script_root = app.path().to_str().unwrap();

        let output = funchost(
            &[
                "start", "--node", "--port", &port, "--script-root", script_root,
                "--max-run-duration", "1", "--report", report.to_str().unwrap(),
            ],
            hosts.path(),
        );

        assert_eq!(output.status.code(), Some(4));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["reason"], "killed_by_timeout");
        assert_eq!(json["ready"], "detected");
    }
}
