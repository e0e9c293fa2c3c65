//! Request/response protocol between the controller and its workers.

use crate::task::CallArgs;
use distdev_core::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a shipped unit is materialised on the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitSource {
    /// Resolved by name in the worker's task registry
    Registered,
    /// Cell-language program run in a local scope on every invocation
    Script(String),
}

/// Unit of work carried by an install call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedUnit {
    /// Identity of the callable; the worker binds the unit under it
    pub id: Uuid,
    /// Name used in logs and for registry lookups
    pub name: String,
    /// How to materialise it
    pub source: UnitSource,
}

impl ShippedUnit {
    /// Text logged when the unit fails on a worker
    #[must_use]
    pub fn source_text(&self) -> &str {
        match &self.source {
            UnitSource::Registered => &self.name,
            UnitSource::Script(text) => text,
        }
    }
}

/// Operation requested of a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Bind a unit in the worker namespace
    Install(ShippedUnit),
    /// Call a previously installed unit
    Invoke {
        /// Identity the unit was installed under
        id: Uuid,
        /// Name, for diagnostics
        name: String,
        /// Arguments, identical on every worker
        args: CallArgs,
    },
    /// Execute raw cell source in the worker's global namespace
    ExecCell {
        /// Cell text
        source: String,
    },
    /// Liveness check
    Ping,
}

impl RemoteOp {
    /// Short operation name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Install(_) => "install",
            Self::Invoke { .. } => "invoke",
            Self::ExecCell { .. } => "exec_cell",
            Self::Ping => "ping",
        }
    }
}

/// Remote request with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Correlation id, unique per connection
    pub id: u64,
    /// Operation
    pub op: RemoteOp,
}

/// Remote response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Id of the request this answers
    pub id: u64,
    /// Value produced, `None` for operations without a value
    pub outcome: Result<Option<Value>, RemoteError>,
}

impl RemoteResponse {
    /// Successful response
    #[must_use]
    pub fn ok(id: u64, value: Option<Value>) -> Self {
        Self {
            id,
            outcome: Ok(value),
        }
    }

    /// Failed response
    #[must_use]
    pub fn error(id: u64, error: RemoteError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

/// Deadline and cancellation for one remote call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Give up when this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Wait indefinitely
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
