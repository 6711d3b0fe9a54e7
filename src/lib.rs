pub mod master;
pub mod message;
pub mod wire;

pub use master::{Engine, EngineConfig, EngineError, MasterServer, Registry};
pub use message::{Heartbeat, Login};
