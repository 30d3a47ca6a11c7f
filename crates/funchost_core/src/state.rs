//! Launch state machine.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Lifecycle of one launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Unresolved,
    Resolved,
    VariantSelected,
    ConfigValidated,
    PortChecked,
    Spawned,
    ReadyDetected,
    /// Readiness was not observed in time. The host keeps running.
    ReadyTimedOut,
    Running,
    StoppedByUser,
    KilledByTimeout,
    ExitedOnItsOwn,
    /// A check failed before any process was created.
    RejectedBeforeLaunch(String),
}

impl Default for LaunchState {
    fn default() -> Self {
        Self::Unresolved
    }
}

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StoppedByUser
                | Self::KilledByTimeout
                | Self::ExitedOnItsOwn
                | Self::RejectedBeforeLaunch(_)
        )
    }

    /// A process exists (or existed) for this launch.
    pub fn has_spawned(&self) -> bool {
        matches!(
            self,
            Self::Spawned
                | Self::ReadyDetected
                | Self::ReadyTimedOut
                | Self::Running
                | Self::StoppedByUser
                | Self::KilledByTimeout
                | Self::ExitedOnItsOwn
        )
    }

    pub fn can_transition_to(&self, next: &LaunchState) -> bool {
        use LaunchState::*;

        if self.is_terminal() {
            return false;
        }
        if let RejectedBeforeLaunch(_) = next {
            return !self.has_spawned();
        }

        matches!(
            (self, next),
            (Unresolved, Resolved)
                | (Resolved, VariantSelected)
                | (VariantSelected, ConfigValidated)
                | (ConfigValidated, PortChecked)
                | (PortChecked, Spawned)
                | (Spawned, ReadyDetected | ReadyTimedOut)
                | (ReadyDetected | ReadyTimedOut, Running)
                // The host may stop before readiness is decided.
                | (Spawned | ReadyDetected | ReadyTimedOut | Running, StoppedByUser | KilledByTimeout | ExitedOnItsOwn)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
            Self::VariantSelected => "variant_selected",
            Self::ConfigValidated => "config_validated",
            Self::PortChecked => "port_checked",
            Self::Spawned => "spawned",
            Self::ReadyDetected => "ready_detected",
            Self::ReadyTimedOut => "ready_timed_out",
            Self::Running => "running",
            Self::StoppedByUser => "stopped_by_user",
            Self::KilledByTimeout => "killed_by_timeout",
            Self::ExitedOnItsOwn => "exited_on_its_own",
            Self::RejectedBeforeLaunch(_) => "rejected_before_launch",
        }
    }
}

impl std::fmt::Display for LaunchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RejectedBeforeLaunch(reason) => write!(f, "rejected_before_launch({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Current state plus the states visited so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchTracker {
    state: LaunchState,
    history: Vec<LaunchState>,
}

impl LaunchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &LaunchState {
        &self.state
    }

    pub fn history(&self) -> &[LaunchState] {
        &self.history
    }

    pub fn advance(&mut self, next: LaunchState) -> CoreResult<()> {
        if !self.state.can_transition_to(&next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Launch state: {} -> {}", self.state, next);
        let previous = std::mem::replace(&mut self.state, next);
        self.history.push(previous);
        Ok(())
    }

    /// Record a rejection. Ignored once a process has been spawned.
    pub fn reject(&mut self, reason: impl Into<String>) {
        let _ = self.advance(LaunchState::RejectedBeforeLaunch(reason.into()));
    }
}
