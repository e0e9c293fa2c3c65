//! Log records shipped from workers to the controller.

use distdev_core::Rank;
use serde::{Deserialize, Serialize};

/// Severity of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    /// Very verbose
    Trace,
    /// Debugging detail
    Debug,
    /// Normal output
    Info,
    /// Something unexpected
    Warn,
    /// A failure
    Error,
}

impl LogLevel {
    /// Upper-case name, as `tracing` prints it
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log line emitted by a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Rank of the emitter
    pub rank: Rank,
    /// Severity
    pub level: LogLevel,
    /// `tracing` target (module path by default)
    pub target: String,
    /// Rendered message including any structured fields
    pub message: String,
}

impl LogRecord {
    /// Create a record
    #[must_use]
    pub fn new(rank: Rank, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            rank,
            level,
            target: String::new(),
            message: message.into(),
        }
    }

    /// Set the target
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Render as the controller prints it: `[rank]: message`
    #[must_use]
    pub fn render(&self) -> String {
        format!("[{}]: {}", self.rank, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_rank_prefixed() {
        let record = LogRecord::new(Rank::new(3), LogLevel::Info, "hello");
        assert_eq!(record.render(), "[3]: hello");
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Trace < LogLevel::Info);
        assert_eq!(LogLevel::from(&tracing::Level::WARN), LogLevel::Warn);
    }
}
