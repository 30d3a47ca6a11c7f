//! Supervision settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Readiness marker the host prints once it accepts requests.
pub const DEFAULT_READY_MARKER: &str = "Job host started";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_RING_CAPACITY: usize = 200;

/// How a host process is supervised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Line substring that marks the host as ready
    pub ready_marker: String,
    /// How long to wait for the ready marker
    pub ready_timeout: Duration,
    /// Stop the host when the ready marker does not show up in time
    pub fail_on_ready_timeout: bool,
    /// Time between graceful termination and a forced kill
    pub grace_period: Duration,
    /// Stop the host after this long, if set
    pub max_run_duration: Option<Duration>,
    /// How long to keep draining output after the process exits
    pub drain_timeout: Duration,
    /// Number of recent lines kept for diagnostics
    pub ring_capacity: usize,
    /// Number of stderr lines included in reports of abnormal exits
    pub stderr_tail_lines: usize,
    /// CI mode (timestamped console output)
    pub ci_mode: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            fail_on_ready_timeout: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_run_duration: None,
            drain_timeout: Duration::from_secs(1),
            ring_capacity: DEFAULT_RING_CAPACITY,
            stderr_tail_lines: 20,
            ci_mode: std::env::var("CI").is_ok(),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn fail_on_ready_timeout(mut self, enabled: bool) -> Self {
        self.fail_on_ready_timeout = enabled;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn max_run_duration(mut self, duration: Option<Duration>) -> Self {
        self.max_run_duration = duration;
        self
    }

    pub fn drain_timeout(mut self, drain: Duration) -> Self {
        self.drain_timeout = drain;
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn ci_mode(mut self) -> Self {
        self.ci_mode = true;
        self
    }
}
