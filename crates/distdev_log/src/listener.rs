//! Controller-side draining of the shared log channel.
//!
//! The listener only runs inside a [`LogWindow`]. Records that arrive while
//! no window is open stay queued and are printed by the next window.

use crate::layer::LogReceiver;
use crate::record::LogRecord;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Destination for aggregated records
pub trait LogSink: Send + Sync {
    /// Write one record
    fn emit(&self, record: &LogRecord);
}

/// Prints `[rank]: message` lines to standard output
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn emit(&self, record: &LogRecord) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", record.render());
    }
}

/// Keeps every record in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Rendered lines so far
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.records().iter().map(LogRecord::render).collect()
    }

    /// Number of records so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Owner of the consumer half of the shared log channel
pub struct LogAggregator {
    rx: Arc<tokio::sync::Mutex<LogReceiver>>,
    sink: Arc<dyn LogSink>,
}

impl LogAggregator {
    /// Create an aggregator draining `rx` into `sink`
    #[must_use]
    pub fn new(rx: LogReceiver, sink: Arc<dyn LogSink>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            sink,
        }
    }

    /// Start the listener. It runs until the returned window is closed or dropped.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(&self) -> LogWindow {
        let stop = CancellationToken::new();
        let rx = Arc::clone(&self.rx);
        let sink = Arc::clone(&self.sink);
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            let mut rx = rx.lock_owned().await;
            let mut emitted = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        // Everything enqueued before the stop request is still printed.
                        while let Ok(record) = rx.try_recv() {
                            sink.emit(&record);
                            emitted += 1;
                        }
                        break;
                    }
                    next = rx.recv() => match next {
                        Some(record) => {
                            sink.emit(&record);
                            emitted += 1;
                        }
                        None => break,
                    },
                }
            }
            emitted
        });

        LogWindow {
            stop,
            handle: Some(handle),
        }
    }
}

/// Scope during which the listener is active
pub struct LogWindow {
    stop: CancellationToken,
    handle: Option<JoinHandle<usize>>,
}

impl LogWindow {
    /// Stop the listener after draining what is already queued.
    ///
    /// Returns the number of records emitted during the window.
    pub async fn close(mut self) -> usize {
        self.stop.cancel();
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for LogWindow {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
