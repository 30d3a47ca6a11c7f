//! Start command - resolve, validate and run the functions host.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args};
use funchost_core::{HostLayout, LaunchOptions, LaunchPlan, LaunchPlanner, LaunchTracker, MergedSettings};
use funchost_runner::{
    ConsoleSink, ExitReason, ExitReport, FileSink, ProcessSupervisor, SupervisorConfig, TokioSpawner,
    DEFAULT_READY_MARKER,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("worker").multiple(false)))]
pub struct StartArgs {
    /// Local port to listen on (default: Host.LocalHttpPort, then 7071)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host variant to run: default, inproc6 or inproc8
    #[arg(long, value_name = "VARIANT")]
    pub runtime: Option<String>,

    /// Worker runtime, overriding FUNCTIONS_WORKER_RUNTIME
    #[arg(long, value_name = "NAME", group = "worker")]
    pub worker_runtime: Option<String>,

    #[arg(long, group = "worker")]
    pub dotnet: bool,

    #[arg(long, group = "worker")]
    pub dotnet_isolated: bool,

    #[arg(long, group = "worker")]
    pub node: bool,

    #[arg(long, group = "worker")]
    pub python: bool,

    #[arg(long, group = "worker")]
    pub java: bool,

    #[arg(long, group = "worker")]
    pub powershell: bool,

    #[arg(long, group = "worker")]
    pub custom: bool,

    /// Target framework of a .NET project (e.g. net8.0); detected from the project file otherwise
    #[arg(long, value_name = "TFM")]
    pub target_framework: Option<String>,

    /// Project directory containing host.json
    #[arg(long, value_name = "DIR")]
    pub script_root: Option<PathBuf>,

    /// Seconds to wait for the readiness marker
    #[arg(short, long, default_value_t = 20)]
    pub timeout: u64,

    /// Stop the host when the readiness marker does not show up in time
    #[arg(long)]
    pub fail_on_ready_timeout: bool,

    /// Stop the host after this many seconds
    #[arg(long, value_name = "SECS", env = "FUNCHOST_MAX_RUN_SECONDS")]
    pub max_run_duration: Option<u64>,

    /// Seconds between graceful termination and a forced kill
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub grace_period: u64,

    /// Output line that marks the host as ready
    #[arg(long, value_name = "TEXT", default_value = DEFAULT_READY_MARKER)]
    pub ready_marker: String,

    /// Directory holding the host builds (defaults to the launcher's directory)
    #[arg(long, value_name = "DIR", env = "FUNCHOST_HOST_ROOT")]
    pub host_root: Option<PathBuf>,

    /// Also append host output to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Write the exit report as JSON to this file
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Print the host command instead of running it
    #[arg(long)]
    pub dry_run: bool,

    /// Timestamped console output (on by default when CI is set)
    #[arg(long)]
    pub ci: bool,

    /// Arguments passed to the host unchanged
    #[arg(last = true, value_name = "HOST_ARGS")]
    pub passthrough: Vec<String>,
}

impl StartArgs {
    /// Worker runtime named by `--worker-runtime` or one of the shorthand flags.
    pub fn worker_runtime_flag(&self) -> Option<String> {
        if let Some(name) = &self.worker_runtime {
            return Some(name.clone());
        }
        [
            (self.dotnet, "dotnet"),
            (self.dotnet_isolated, "dotnet-isolated"),
            (self.node, "node"),
            (self.python, "python"),
            (self.java, "java"),
            (self.powershell, "powershell"),
            (self.custom, "custom"),
        ]
        .into_iter()
        .find(|(set, _)| *set)
        .map(|(_, name)| name.to_string())
    }

    fn launch_options(&self, project_dir: PathBuf, verbose: bool) -> LaunchOptions {
        let mut options = LaunchOptions::new(project_dir)
            .passthrough(self.passthrough.clone())
            .verbose(verbose);
        if let Some(runtime) = self.worker_runtime_flag() {
            options = options.worker_runtime(runtime);
        }
        if let Some(variant) = &self.runtime {
            options = options.variant(variant.clone());
        }
        if let Some(tf) = &self.target_framework {
            options = options.target_framework(tf.clone());
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        options
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let config = SupervisorConfig::new()
            .ready_marker(self.ready_marker.clone())
            .ready_timeout(Duration::from_secs(self.timeout))
            .fail_on_ready_timeout(self.fail_on_ready_timeout)
            .grace_period(Duration::from_secs(self.grace_period))
            .max_run_duration(self.max_run_duration.map(Duration::from_secs));
        if self.ci {
            config.ci_mode()
        } else {
            config
        }
    }
}

/// The host ran but did not end cleanly.
#[derive(Debug, Error)]
pub enum HostRunError {
    #[error("Host was stopped after exceeding its time limit")]
    KilledByTimeout,

    #[error("Host exited with code {code}")]
    AbnormalExit { code: i32 },

    #[error("Host was terminated by a signal")]
    Signaled,
}

impl HostRunError {
    fn from_report(report: &ExitReport) -> Option<Self> {
        if report.success() {
            return None;
        }
        Some(match (report.reason, report.exit_code) {
            (ExitReason::KilledByTimeout, _) => Self::KilledByTimeout,
            (_, Some(code)) => Self::AbnormalExit { code },
            (_, None) => Self::Signaled,
        })
    }
}

pub async fn execute(args: StartArgs, verbose: bool) -> Result<()> {
    let project_dir = match &args.script_root {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read the current directory")?,
    };
    debug!("Project directory: {}", project_dir.display());

    let settings = MergedSettings::load(&project_dir)?;
    let options = args.launch_options(project_dir, verbose);
    let mut tracker = LaunchTracker::new();
    let plan = LaunchPlanner::default().plan(&options, &settings, &mut tracker)?;

    let layout = match &args.host_root {
        Some(root) => HostLayout::new(root),
        None => HostLayout::from_current_exe()?,
    };

    if args.dry_run {
        print_dry_run(&plan, &layout);
        return Ok(());
    }

    let config = args.supervisor_config();
    let console = ConsoleSink::new(config.ci_mode);
    let mut supervisor =
        ProcessSupervisor::new(Arc::new(TokioSpawner::new()), config).with_sink(Arc::new(console));
    if let Some(path) = &args.log_file {
        let sink = FileSink::create(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        supervisor = supervisor.with_sink(Arc::new(sink));
    }

    let process = supervisor.start(&plan.request, &layout, &mut tracker).await?;
    info!(
        "Started {} host (pid {:?}) on port {}",
        plan.selection.variant,
        process.pid(),
        plan.request.port
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let report = process.run(cancel).await?;
    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    match HostRunError::from_report(&report) {
        None => Ok(()),
        Some(err) => {
            print_failure(&report);
            Err(err.into())
        }
    }
}

fn print_dry_run(plan: &LaunchPlan, layout: &HostLayout) {
    let executable = layout.executable_for(plan.selection.variant);
    if !executable.is_file() {
        eprintln!("Warning: {} does not exist", executable.display());
    }

    println!("{}", plan.request.display_command(&executable));
    println!();
    println!("Working directory: {}", plan.request.working_dir.display());
    println!("Environment:");
    for (key, value) in plan.request.environment() {
        println!("  {}={}", key, value);
    }
}

fn print_failure(report: &ExitReport) {
    eprintln!(
        "Host started at {} ran for {:.1}s ({:?}, exit code {})",
        report.started_at.format("%H:%M:%S"),
        report.duration_ms as f64 / 1000.0,
        report.reason,
        report
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !report.stderr_tail.is_empty() {
        eprintln!("Last stderr lines:");
        for line in &report.stderr_tail {
            eprintln!("  {}", line);
        }
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}
