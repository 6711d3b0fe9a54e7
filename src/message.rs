//! JSON payload records carried in wire bodies.
//!
//! Field names match the wire keys exactly; the master treats both records as
//! opaque pass-through data from the worker.
use serde::{Deserialize, Serialize};

/// Handshake body sent by a worker with its LOGIN command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    /// Address the worker identifies itself by; doubles as its registry key.
    pub addr: String,
}

/// Cache usage statistics piggybacked on every heartbeat response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub hit: u64,
    pub cachedsize: u64,
    pub gets: u64,
    pub puts: u64,
    pub maxcachesize: u64,
}
