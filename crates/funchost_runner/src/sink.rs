//! Destinations for host output.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::log::{LogHandler, LogLine, LogStream};

/// Receives every line the multiplexer drains, in order.
///
/// Sinks are called from the fan-out task and must not block for long.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &LogLine);

    /// Called once after the last line.
    fn flush(&self) {}
}

/// Echoes host output to the terminal.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSink {
    ci_mode: bool,
}

impl ConsoleSink {
    pub fn new(ci_mode: bool) -> Self {
        Self { ci_mode }
    }
}

impl LogSink for ConsoleSink {
    fn write_line(&self, line: &LogLine) {
        if self.ci_mode {
            println!("{}", line.ci_format());
            return;
        }
        match line.stream {
            LogStream::Stdout => println!("{}", line.message),
            LogStream::Stderr => eprintln!("{}", line.message),
        }
    }
}

/// Appends host output to a file in CI format.
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    failed: Mutex<bool>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            failed: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn report(&self, err: std::io::Error) {
        let mut failed = self.failed.lock();
        if !*failed {
            warn!("Failed to write host output to {}: {}", self.path.display(), err);
            *failed = true;
        }
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &LogLine) {
        let result = writeln!(self.writer.lock(), "{}", line.ci_format());
        if let Err(e) = result {
            self.report(e);
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            self.report(e);
        }
    }
}

/// Forwards lines to a callback.
pub struct HandlerSink {
    handler: LogHandler,
}

impl HandlerSink {
    pub fn new(handler: LogHandler) -> Self {
        Self { handler }
    }
}

impl LogSink for HandlerSink {
    fn write_line(&self, line: &LogLine) {
        (self.handler)(line.clone());
    }
}
