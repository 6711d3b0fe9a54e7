//! The unit of work a caller thread hands to a connection's event loop.
use std::io::{Read, Write};
use std::sync::mpsc;

use crate::wire::Command;

use super::engine::EngineError;

/// What a job carries besides its command, tagged per command kind so each
/// executor only ever sees the variant it understands.
pub enum Payload {
    /// Fetched bytes travel back through the outcome channel.
    Collect,
    /// Fetched bytes are streamed straight into this sink.
    Sink(Box<dyn Write + Send>),
    /// Stored bytes are streamed from this source until exhausted.
    Source(Box<dyn Read + Send>),
    /// The command carries everything it needs.
    None,
}

/// Result reported back to the submitting caller; `Some` bytes only for a
/// plain fetch.
pub type Outcome = Result<Option<Vec<u8>>, EngineError>;

/// One caller-submitted protocol exchange. Consumed by exactly one loop
/// iteration and reported to exactly one caller.
pub struct Job {
    command: Command,
    payload: Payload,
    done: mpsc::Sender<Outcome>,
}

impl Job {
    pub(crate) fn new(command: Command, payload: Payload, done: mpsc::Sender<Outcome>) -> Self {
        Self {
            command,
            payload,
            done,
        }
    }

    /// Splits the job for dispatch; the sender is the job's single-use
    /// completion channel.
    pub(crate) fn into_parts(self) -> (Command, Payload, mpsc::Sender<Outcome>) {
        (self.command, self.payload, self.done)
    }

    /// Delivers the job's single outcome. The caller may have given up
    /// waiting, so a dead receiver is not an error here.
    pub(crate) fn complete(self, outcome: Outcome) {
        let _ = self.done.send(outcome);
    }
}
