//! # funchost_runner
//!
//! Host process supervision for funchost.
//!
//! This crate starts the host executable chosen by `funchost_core`, drains
//! its output and supervises it until it is stopped.
//!
//! # Features
//!
//! - **Supervisor**: spawn, readiness detection, graceful then forced stop
//! - **Multiplexer**: concurrent stdout/stderr draining with a ring buffer
//! - **Watchers**: wait for (or assert the absence of) matching lines
//! - **Sinks**: console (CI-friendly formatting), log file, callbacks
//! - **Mock Spawner**: for testing without host binaries
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use funchost_core::{HostLayout, HostVariant, LaunchRequest, LaunchTracker, WorkerRuntime};
//! use funchost_runner::{ConsoleSink, ProcessSupervisor, SupervisorConfig, TokioSpawner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request = LaunchRequest::new(WorkerRuntime::Node, HostVariant::Default, ".");
//!     let supervisor = ProcessSupervisor::new(Arc::new(TokioSpawner::new()), SupervisorConfig::default())
//!         .with_sink(Arc::new(ConsoleSink::new(false)));
//!
//!     let mut tracker = LaunchTracker::new();
//!     let process = supervisor
//!         .start(&request, &HostLayout::from_current_exe()?, &mut tracker)
//!         .await?;
//!     let report = process.run(CancellationToken::new()).await?;
//!     println!("Exit code: {:?}", report.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod log;
pub mod mock;
pub mod multiplexer;
pub mod sink;
pub mod spawner;
pub mod supervisor;
pub mod watcher;

pub use config::{SupervisorConfig, DEFAULT_READY_MARKER};
pub use error::{RunnerError, RunnerResult};
pub use log::{LogHandler, LogLine, LogStream};
pub use mock::{CapturedCall, MockExit, MockResponse, MockSpawner};
pub use multiplexer::{LogSubscription, StreamMultiplexer};
pub use sink::{ConsoleSink, FileSink, HandlerSink, LogSink};
pub use spawner::{HostCommand, HostHandle, HostSpawner, SpawnedHost, TokioSpawner};
pub use supervisor::{ExitReason, ExitReport, ProcessState, ProcessSupervisor, SupervisedProcess};
pub use watcher::{contains, matches_regex, LogWatcher, ReadyStatus, WatchOutcome};
