use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use strum::Display;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::process::OutputStream;

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub kind: OutputKind,
    pub line: String,
}

/// Ring buffer of the most recent runtime output lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, kind: OutputKind, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine { kind, line });
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// The last `n` lines joined for inclusion in an error message.
    pub fn tail(&self, n: usize) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(n);
        lines
            .iter()
            .skip(skip)
            .map(|l| l.line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Forward each output line to tracing and into `buffer`. The task ends at EOF.
pub fn attach_output(stream: OutputStream, kind: OutputKind, buffer: LogBuffer) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    match kind {
                        OutputKind::Stdout => info!(target: "flink_runtime", "{}", line),
                        OutputKind::Stderr => warn!(target: "flink_runtime", "{}", line),
                    }
                    buffer.push(kind, line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(stream = %kind, error = %e, "Failed to read runtime output");
                    break;
                }
            }
        }
    })
}
