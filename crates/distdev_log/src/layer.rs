//! Worker-side redirection of `tracing` output into the shared log channel.
//!
//! A worker replaces its whole logging subsystem with a subscriber whose
//! only output is a [`ForwardLayer`]: every event becomes a [`LogRecord`]
//! tagged with the worker's rank and is queued for the controller.

use crate::record::{LogLevel, LogRecord};
use distdev_core::Rank;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Producer half of a log channel
pub type LogSender = mpsc::UnboundedSender<LogRecord>;

/// Consumer half of a log channel
pub type LogReceiver = mpsc::UnboundedReceiver<LogRecord>;

/// Filter applied on workers when `RUST_LOG` is unset
pub const DEFAULT_WORKER_FILTER: &str = "info";

/// Create an unbounded multi-producer, single-consumer log channel
#[must_use]
pub fn log_channel() -> (LogSender, LogReceiver) {
    mpsc::unbounded_channel()
}

/// `tracing` layer that turns events into rank-tagged records
pub struct ForwardLayer {
    rank: Rank,
    tx: LogSender,
}

impl ForwardLayer {
    /// Create a layer forwarding into `tx`
    #[must_use]
    pub fn new(rank: Rank, tx: LogSender) -> Self {
        Self { rank, tx }
    }
}

impl<S> Layer<S> for ForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord::new(self.rank, LogLevel::from(metadata.level()), visitor.finish())
            .with_target(metadata.target());

        // The receiver only disappears once the worker is shutting down.
        let _ = self.tx.send(record);
    }
}

/// Collects the `message` field plus any other fields as `key=value`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Build the subscriber a worker uses in place of terminal output
pub fn worker_subscriber(rank: Rank, tx: LogSender) -> impl Subscriber + Send + Sync + 'static {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_WORKER_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(ForwardLayer::new(rank, tx))
}

/// Install the worker subscriber as the process-wide default
///
/// # Errors
///
/// Returns error if a global subscriber is already installed
pub fn install_worker_logging(rank: Rank, tx: LogSender) -> Result<(), TryInitError> {
    worker_subscriber(rank, tx).try_init()
}
