//! Concurrent draining of a child's stdout and stderr.
//!
//! Each stream has its own reader task. Readers push decoded lines into a
//! single channel, and a fan-out task delivers them to the sinks, the ring
//! buffer and every subscriber. Each subscriber has its own unbounded queue,
//! so a slow reader never loses lines. Lines from one stream keep their
//! order; ordering across the two streams is best effort.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::log::{decode_line, LogLine, LogStream};
use crate::sink::LogSink;

struct Shared {
    recent: VecDeque<LogLine>,
    capacity: usize,
    subscribers: Vec<mpsc::UnboundedSender<LogLine>>,
    closed: bool,
}

/// A live view of the multiplexed output.
pub struct LogSubscription {
    backlog: VecDeque<LogLine>,
    receiver: mpsc::UnboundedReceiver<LogLine>,
}

impl LogSubscription {
    /// Next line, or `None` once the streams are closed.
    pub async fn recv(&mut self) -> Option<LogLine> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }
        self.receiver.recv().await
    }
}

/// Owns the reader and fan-out tasks for one process.
pub struct StreamMultiplexer {
    shared: Arc<Mutex<Shared>>,
    halt: CancellationToken,
    fan_out: Option<JoinHandle<()>>,
}

impl StreamMultiplexer {
    /// Start draining `stdout` and `stderr` immediately.
    pub fn attach<O, E>(stdout: O, stderr: E, sinks: Vec<Arc<dyn LogSink>>, capacity: usize) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            subscribers: Vec::new(),
            closed: false,
        }));
        let halt = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        spawn_reader(stdout, LogStream::Stdout, tx.clone(), halt.clone());
        spawn_reader(stderr, LogStream::Stderr, tx, halt.clone());
        let fan_out = tokio::spawn(fan_out(rx, sinks, shared.clone()));

        Self {
            shared,
            halt,
            fan_out: Some(fan_out),
        }
    }

    /// Lines emitted from now on.
    pub fn subscribe(&self) -> LogSubscription {
        self.subscription(false)
    }

    /// Lines still in the ring buffer, followed by lines emitted from now on.
    ///
    /// No line is delivered twice or skipped between the two.
    pub fn subscribe_with_backlog(&self) -> LogSubscription {
        self.subscription(true)
    }

    fn subscription(&self, with_backlog: bool) -> LogSubscription {
        let mut shared = self.shared.lock();
        let backlog = if with_backlog {
            shared.recent.clone()
        } else {
            VecDeque::new()
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        // After close the sender is dropped here and the receiver ends.
        if !shared.closed {
            shared.subscribers.push(sender);
        }
        LogSubscription { backlog, receiver }
    }

    /// Snapshot of the most recent lines, oldest first.
    pub fn recent_lines(&self) -> Vec<LogLine> {
        self.shared.lock().recent.iter().cloned().collect()
    }

    /// Last `n` stderr messages, oldest first.
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        let shared = self.shared.lock();
        let mut tail: Vec<String> = shared
            .recent
            .iter()
            .rev()
            .filter(|l| l.stream == LogStream::Stderr)
            .take(n)
            .map(|l| l.message.clone())
            .collect();
        tail.reverse();
        tail
    }

    /// Both streams have been drained or the multiplexer was halted.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop reading. Lines already read are still delivered.
    pub fn halt(&self) {
        self.halt.cancel();
    }

    /// Wait for the streams to close, halting after `drain` if they do not.
    pub async fn shutdown(&mut self, drain: Duration) {
        let Some(mut task) = self.fan_out.take() else {
            return;
        };
        if tokio::time::timeout(drain, &mut task).await.is_ok() {
            return;
        }
        debug!("Host output still open after {:?}, halting readers", drain);
        self.halt();
        if let Err(e) = task.await {
            warn!("Log fan-out task failed: {}", e);
        }
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.halt.cancel();
    }
}

fn spawn_reader<R>(
    stream: R,
    origin: LogStream,
    tx: mpsc::UnboundedSender<LogLine>,
    halt: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = halt.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(LogLine::new(origin, decode_line(&buf))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading host {}: {}", origin, e);
                    break;
                }
            }
        }
        debug!("Host {} closed", origin);
    })
}

async fn fan_out(
    mut rx: mpsc::UnboundedReceiver<LogLine>,
    sinks: Vec<Arc<dyn LogSink>>,
    shared: Arc<Mutex<Shared>>,
) {
    while let Some(line) = rx.recv().await {
        for sink in &sinks {
            sink.write_line(&line);
        }

        // Ring buffer update and delivery happen under one lock so that
        // subscribe_with_backlog sees each line exactly once.
        {
            let mut state = shared.lock();
            if state.recent.len() == state.capacity {
                state.recent.pop_front();
            }
            if state.capacity > 0 {
                state.recent.push_back(line.clone());
            }
            // Dropped subscriptions are pruned here.
            state
                .subscribers
                .retain(|subscriber| subscriber.send(line.clone()).is_ok());
        }
    }

    for sink in &sinks {
        sink.flush();
    }
    let mut state = shared.lock();
    state.closed = true;
    state.subscribers.clear();
}
