//! Master-side coordination for a pool of cache workers.
//!
//! The master keeps one persistent connection per worker node. Each
//! connection is driven by its own thread (the [`Driver`] event loop) while
//! any number of caller threads use the shared [`Engine`] handle to fetch and
//! store values; the loop serializes those requests, interleaved with
//! periodic heartbeats, onto the single protocol stream.
//!
//! # Overview
//!
//! Request routing works in two steps: a caller asks the [`Registry`] for a
//! live worker, then invokes a blocking operation on that worker's engine.
//! The registry is kept in sync with connection lifetimes by the
//! [`MasterServer`] accept loop, which registers a worker after a successful
//! login handshake and unregisters it when its connection loop exits.
//!
//! Workers are considered interchangeable at this layer; retry and backoff
//! policy for a failed or missing worker belongs to the caller, which can
//! simply select again.
//!
//! # Key Components
//!
//! - [`Engine`]: caller-facing handle to one worker connection.
//! - [`Driver`]: the connection's event loop, sole owner of the socket.
//! - [`Registry`]: concurrency-safe worker map with round-robin selection.
//! - [`MasterServer`]: listener tying worker lifetimes to the registry.
mod engine;
mod job;
mod registry;
mod server;
#[cfg(test)]
pub(crate) mod testutil;

pub use engine::{Driver, Engine, EngineConfig, EngineError};
pub use job::{Job, Outcome, Payload};
pub use registry::Registry;
pub use server::MasterServer;
