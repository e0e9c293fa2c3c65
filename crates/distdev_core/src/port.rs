//! Rendezvous port allocation.

use crate::error::{ClusterError, ClusterResult};
use std::net::{Ipv4Addr, TcpListener};

/// Find a currently unused local port.
///
/// The probe socket is released before returning, so nothing holds the
/// port afterwards.
///
/// # Errors
///
/// Returns error if no port could be bound
pub fn free_port() -> ClusterResult<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|e| {
        ClusterError::PortAllocation {
            reason: e.to_string(),
        }
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ClusterError::PortAllocation {
            reason: e.to_string(),
        })?
        .port();
    drop(listener);
    Ok(port)
}
