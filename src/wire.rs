//! Line-oriented wire codec shared by the master and its workers.
//!
//! A command frame is one tag line, followed by one line per argument,
//! optionally followed by a 4-byte big-endian length prefix and a raw body.
//! A response frame is one status line (`OK` or an error message), optionally
//! followed by a length-prefixed body.
//!
//! The master only ever *writes* full command frames and *reads* status lines
//! and bodies; workers do the inverse. Both sides know the argument count for
//! every tag, so frames carry no argument-count field.
//!
//! # Key Components
//!
//! - [`Tag`]: the fixed command vocabulary.
//! - [`Command`]: an outbound frame (tag + arguments + optional body).
//! - [`read_line`] / [`read_body`] / [`copy_body`]: inbound frame primitives.
use std::io::{self, BufRead, Read, Write};

/// Bodies larger than this are treated as stream corruption rather than
/// honoured; a torn length prefix would otherwise ask for gigabytes.
pub const MAX_BODY: u32 = 64 * 1024 * 1024;

/// Command vocabulary exchanged between master and worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Login,
    Ok,
    Ping,
    Get,
    GetStream,
    Put,
    PutFromReader,
}

impl Tag {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Tag::Login => b"LOGIN",
            Tag::Ok => b"OK",
            Tag::Ping => b"PING",
            Tag::Get => b"GET",
            Tag::GetStream => b"GET_STREAM",
            Tag::Put => b"PUT",
            Tag::PutFromReader => b"PUT_FROM_READER",
        }
    }

    /// Parses a tag line; `None` for anything outside the vocabulary.
    pub fn from_bytes(line: &[u8]) -> Option<Self> {
        match line {
            b"LOGIN" => Some(Tag::Login),
            b"OK" => Some(Tag::Ok),
            b"PING" => Some(Tag::Ping),
            b"GET" => Some(Tag::Get),
            b"GET_STREAM" => Some(Tag::GetStream),
            b"PUT" => Some(Tag::Put),
            b"PUT_FROM_READER" => Some(Tag::PutFromReader),
            _ => None,
        }
    }
}

/// One outbound command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: Tag,
    pub args: Vec<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

impl Command {
    pub fn new(tag: Tag, args: Vec<Vec<u8>>) -> Self {
        Self {
            tag,
            args,
            body: None,
        }
    }

    pub fn with_body(tag: Tag, args: Vec<Vec<u8>>, body: Vec<u8>) -> Self {
        Self {
            tag,
            args,
            body: Some(body),
        }
    }

    /// Serializes the full frame onto `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(self.tag.as_bytes())?;
        w.write_all(b"\n")?;
        for arg in &self.args {
            w.write_all(arg)?;
            w.write_all(b"\n")?;
        }
        if let Some(body) = &self.body {
            let len = u32::try_from(body.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "body too large"))?;
            w.write_all(&len.to_be_bytes())?;
            w.write_all(body)?;
        }
        w.flush()
    }
}

/// Reads one `\n`-terminated line, stripping the terminator and any `\r`.
///
/// EOF before the terminator is an [`io::ErrorKind::UnexpectedEof`]; a clean
/// EOF at a frame boundary surfaces the same way, which is fine because the
/// caller always expects a specific next frame.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 || line.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        ));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

fn read_body_len<R: BufRead>(reader: &mut R) -> io::Result<u32> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("body length {len} exceeds limit"),
        ));
    }
    Ok(len)
}

/// Reads a length-prefixed body into memory.
pub fn read_body<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_body_len(reader)?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

/// Reads a length-prefixed body, streaming it straight into `sink` without
/// buffering the whole value. Returns the number of body bytes copied.
pub fn copy_body<R: BufRead, W: Write + ?Sized>(reader: &mut R, sink: &mut W) -> io::Result<u64> {
    let len = u64::from(read_body_len(reader)?);
    let copied = io::copy(&mut reader.take(len), sink)?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-body",
        ));
    }
    Ok(copied)
}
