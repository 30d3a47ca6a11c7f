//! Waiting for specific lines in host output.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::log::LogLine;
use crate::multiplexer::LogSubscription;

/// Result of [`LogWatcher::wait_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Found(LogLine),
    TimedOut,
    /// Both streams closed without a match.
    StreamClosed,
    Cancelled,
}

impl WatchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Readiness as recorded in an exit report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyStatus {
    Detected,
    TimedOut,
    /// The host stopped before readiness was decided.
    Unknown,
}

impl From<&WatchOutcome> for ReadyStatus {
    fn from(outcome: &WatchOutcome) -> Self {
        match outcome {
            WatchOutcome::Found(_) => Self::Detected,
            WatchOutcome::TimedOut => Self::TimedOut,
            WatchOutcome::StreamClosed | WatchOutcome::Cancelled => Self::Unknown,
        }
    }
}

/// Line predicate matching a substring.
pub fn contains(text: impl Into<String>) -> impl Fn(&LogLine) -> bool + Send + Sync {
    let text = text.into();
    move |line: &LogLine| line.message.contains(&text)
}

/// Line predicate matching a regular expression.
pub fn matches_regex(pattern: Regex) -> impl Fn(&LogLine) -> bool + Send + Sync {
    move |line: &LogLine| pattern.is_match(&line.message)
}

pub struct LogWatcher;

impl LogWatcher {
    /// Wait until a line satisfies `predicate`.
    ///
    /// Resolves within `timeout` even if the streams stay open and silent.
    pub async fn wait_for<P>(
        subscription: &mut LogSubscription,
        predicate: P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WatchOutcome
    where
        P: Fn(&LogLine) -> bool,
    {
        let search = async {
            while let Some(line) = subscription.recv().await {
                if predicate(&line) {
                    return WatchOutcome::Found(line);
                }
            }
            WatchOutcome::StreamClosed
        };

        tokio::select! {
            _ = cancel.cancelled() => WatchOutcome::Cancelled,
            result = tokio::time::timeout(timeout, search) => {
                result.unwrap_or(WatchOutcome::TimedOut)
            }
        }
    }

    /// Check that no line satisfying `predicate` appears within `window`.
    ///
    /// Returns the offending line if one does. Closing or cancelling before
    /// the window ends counts as absent.
    pub async fn expect_absent<P>(
        subscription: &mut LogSubscription,
        predicate: P,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LogLine>
    where
        P: Fn(&LogLine) -> bool,
    {
        match Self::wait_for(subscription, predicate, window, cancel).await {
            WatchOutcome::Found(line) => Err(line),
            WatchOutcome::TimedOut | WatchOutcome::StreamClosed | WatchOutcome::Cancelled => Ok(()),
        }
    }
}
