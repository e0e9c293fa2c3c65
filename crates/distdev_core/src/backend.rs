//! Backend identifiers.

use crate::error::{ClusterError, ClusterResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How worker participants are launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One OS process per worker
    #[default]
    Process,
    /// One OS thread (with its own runtime) per worker, inside the controller process
    Thread,
}

impl Backend {
    /// Canonical identifier
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Thread => "thread",
        }
    }
}

impl FromStr for Backend {
    type Err = ClusterError;

    fn from_str(s: &str) -> ClusterResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "tcp" | "gloo" | "cpu" => Ok(Self::Process),
            "thread" | "local" => Ok(Self::Thread),
            other => Err(ClusterError::Config {
                reason: format!("unknown backend: {}", other),
            }),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("process".parse::<Backend>().unwrap(), Backend::Process);
        assert_eq!("gloo".parse::<Backend>().unwrap(), Backend::Process);
        assert_eq!(" Thread ".parse::<Backend>().unwrap(), Backend::Thread);
    }

    #[test]
    fn test_parse_unknown() {
        let err = "nccl".parse::<Backend>().unwrap_err();
        assert!(err.to_string().contains("nccl"));
    }

    #[test]
    fn test_display_roundtrip() {
        for backend in [Backend::Process, Backend::Thread] {
            assert_eq!(backend.to_string().parse::<Backend>().unwrap(), backend);
        }
    }
}
