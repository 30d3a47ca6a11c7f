//! Log line types shared by the multiplexer, sinks and watchers.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One line of host output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: chrono::DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogLine {
    pub fn new(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            message: message.into(),
        }
    }

    pub fn stdout(message: impl Into<String>) -> Self {
        Self::new(LogStream::Stdout, message)
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self::new(LogStream::Stderr, message)
    }

    /// CI-friendly rendering: `[timestamp] [stream] message`.
    pub fn ci_format(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.stream,
            self.message
        )
    }
}

/// Log stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Log handler callback type.
pub type LogHandler = Arc<dyn Fn(LogLine) + Send + Sync>;

/// Decode raw bytes of one line: lossy UTF-8, trailing `\n`/`\r\n` removed.
pub(crate) fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
