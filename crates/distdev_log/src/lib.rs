//! distdev Log Aggregation
//!
//! Workers redirect their `tracing` output into rank-tagged records; the
//! controller drains those records from one shared channel and prints them
//! in arrival order while a call is in flight.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod layer;
pub mod listener;
pub mod record;

pub use layer::{
    DEFAULT_WORKER_FILTER, ForwardLayer, LogReceiver, LogSender, install_worker_logging,
    log_channel, worker_subscriber,
};
pub use listener::{LogAggregator, LogSink, LogWindow, MemorySink, StdoutSink};
pub use record::{LogLevel, LogRecord};
