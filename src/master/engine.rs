//! Per-worker connection engine.
//!
//! Exactly one [`Driver`] ever reads from or writes to a worker's socket; any
//! number of caller threads talk to it through the [`Engine`] handle, which
//! only enqueues jobs and blocks on their private completion channels. That
//! single-owner discipline is what keeps request/response frames from
//! interleaving on the wire.
//!
//! A connection moves through: handshake ([`Engine::handshake`]) -> ready
//! (the driver's loop) -> stopped. The loop waits on three event sources each
//! iteration: the heartbeat timer, job arrival, and the stop signal. A failed
//! heartbeat or any socket error is fatal; the loop tears the connection down
//! and drains still-queued jobs so no caller is left blocked.
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::message::{Heartbeat, Login};
use crate::wire::{self, Command, Tag};

use super::job::{Job, Outcome, Payload};

/// Errors surfaced by a worker connection.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The worker answered with an error status line; the connection itself
    /// is still healthy.
    #[error("worker error: {0}")]
    Remote(String),

    #[error("connection stopped")]
    Stopped,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Timing knobs for one connection. The deadlines bound only the heartbeat
/// exchange; regular commands rely on the next heartbeat to detect a hung
/// worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

const IDLE: i64 = -1;

/// State shared between the caller-facing handle and the driver.
#[derive(Debug)]
struct Shared {
    stream: TcpStream,
    started: Instant,
    /// Nanoseconds since `started` when the current exchange began, or
    /// [`IDLE`]. Written by the driver, read opportunistically by callers.
    busy_since: AtomicI64,
    stopped: AtomicBool,
    /// Job intake. Guarded so that the stopped check and the enqueue are one
    /// atomic step; teardown takes the sender under the same lock, so no
    /// submission can race past a concurrent close.
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    last_beat: Mutex<Option<Heartbeat>>,
}

impl Shared {
    fn mark_busy(&self) {
        self.busy_since
            .store(self.started.elapsed().as_nanos() as i64, Ordering::SeqCst);
    }

    fn mark_idle(&self) {
        self.busy_since.store(IDLE, Ordering::SeqCst);
    }

    /// Stops the connection. Safe to call from any thread, any number of
    /// times; only the first call closes the socket.
    fn teardown(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        jobs.take();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Caller-facing handle to one worker connection.
///
/// All request methods are blocking and may be called concurrently from any
/// number of threads.
#[derive(Debug)]
pub struct Engine {
    shared: Arc<Shared>,
    login: Login,
    peer: SocketAddr,
}

impl Engine {
    /// Runs the login exchange on a freshly accepted worker socket.
    ///
    /// The first frame must be a LOGIN command with a JSON body identifying
    /// the worker; the master acknowledges with OK. On any failure the socket
    /// is closed and the connection must not be registered.
    ///
    /// Returns the shared handle plus the [`Driver`] that owns the socket
    /// from here on.
    pub fn handshake(
        stream: TcpStream,
        config: EngineConfig,
    ) -> Result<(Arc<Self>, Driver), EngineError> {
        let peer = stream.peer_addr()?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream.try_clone()?;

        let login = match login_exchange(&mut reader, &mut writer) {
            Ok(login) => login,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(e);
            }
        };

        let (jobs_tx, jobs_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            stream,
            started: Instant::now(),
            busy_since: AtomicI64::new(IDLE),
            stopped: AtomicBool::new(false),
            jobs: Mutex::new(Some(jobs_tx)),
            last_beat: Mutex::new(None),
        });

        let engine = Arc::new(Engine {
            shared: Arc::clone(&shared),
            login,
            peer,
        });
        let driver = Driver {
            shared,
            reader,
            writer,
            jobs: jobs_rx,
            config,
            peer,
        };
        Ok((engine, driver))
    }

    /// Metadata the worker reported at login.
    pub fn login(&self) -> &Login {
        &self.login
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Most recent statistics the worker reported on a heartbeat.
    pub fn last_heartbeat(&self) -> Option<Heartbeat> {
        *self.shared.last_beat.lock().unwrap()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// How long the connection has been occupied by the in-flight heartbeat
    /// or job; `None` when idle. Reads may be slightly stale.
    pub fn busy_for(&self) -> Option<Duration> {
        let since = self.shared.busy_since.load(Ordering::SeqCst);
        if since < 0 {
            return None;
        }
        let now = self.shared.started.elapsed().as_nanos() as i64;
        Some(Duration::from_nanos(now.saturating_sub(since) as u64))
    }

    /// Stops the connection; idempotent and safe from any thread.
    pub fn close(&self) {
        self.shared.teardown();
    }

    /// Retrieves the value stored under `key`.
    pub fn fetch(&self, key: &str) -> Result<Vec<u8>, EngineError> {
        let rx = self.submit(
            Command::new(Tag::Get, vec![key.as_bytes().to_vec()]),
            Payload::Collect,
        )?;
        match wait(rx)? {
            Some(bytes) => Ok(bytes),
            None => Err(EngineError::Protocol("fetch completed without a body".into())),
        }
    }

    /// Stores `value` under `key`.
    pub fn store(&self, key: &str, value: Vec<u8>) -> Result<(), EngineError> {
        let rx = self.submit(
            Command::with_body(Tag::Put, vec![key.as_bytes().to_vec()], value),
            Payload::None,
        )?;
        wait(rx).map(|_| ())
    }

    /// Retrieves the value stored under `key`, streaming it into `sink`
    /// without buffering it whole.
    pub fn fetch_to_sink(&self, key: &str, sink: Box<dyn Write + Send>) -> Result<(), EngineError> {
        let rx = self.submit(
            Command::new(Tag::GetStream, vec![key.as_bytes().to_vec()]),
            Payload::Sink(sink),
        )?;
        wait(rx).map(|_| ())
    }

    /// Stores the bytes read from `source` under `key`, copying until the
    /// source is exhausted.
    pub fn store_from_source(
        &self,
        key: &str,
        source: Box<dyn Read + Send>,
    ) -> Result<(), EngineError> {
        let rx = self.submit(
            Command::new(Tag::PutFromReader, vec![key.as_bytes().to_vec()]),
            Payload::Source(source),
        )?;
        wait(rx).map(|_| ())
    }

    fn submit(
        &self,
        command: Command,
        payload: Payload,
    ) -> Result<mpsc::Receiver<Outcome>, EngineError> {
        let (done_tx, done_rx) = mpsc::channel();
        let jobs = self.shared.jobs.lock().unwrap();
        match jobs.as_ref() {
            Some(sender) => sender
                .send(Job::new(command, payload, done_tx))
                .map_err(|_| EngineError::Stopped)?,
            None => return Err(EngineError::Stopped),
        }
        Ok(done_rx)
    }
}

/// Blocks for the job's outcome. A dropped sender means the loop died before
/// completing the job, which reads as a stopped connection.
fn wait(rx: mpsc::Receiver<Outcome>) -> Outcome {
    rx.recv().unwrap_or(Err(EngineError::Stopped))
}

fn login_exchange(
    reader: &mut BufReader<TcpStream>,
    writer: &mut TcpStream,
) -> Result<Login, EngineError> {
    let line = wire::read_line(reader)?;
    if Tag::from_bytes(&line) != Some(Tag::Login) {
        return Err(EngineError::Handshake(format!(
            "first frame must be LOGIN, got '{}'",
            String::from_utf8_lossy(&line)
        )));
    }
    let body = wire::read_body(reader)?;
    let login: Login = serde_json::from_slice(&body)?;
    Command::new(Tag::Ok, vec![]).write_to(writer)?;
    Ok(login)
}

/// Sole owner of a worker socket after the handshake. [`run`](Driver::run)
/// is the connection's event loop and must be given its own thread.
#[derive(Debug)]
pub struct Driver {
    shared: Arc<Shared>,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    jobs: mpsc::Receiver<Job>,
    config: EngineConfig,
    peer: SocketAddr,
}

impl Driver {
    /// Runs the connection until it stops: heartbeats fire on the configured
    /// interval, jobs execute one at a time in arrival order, and a closed
    /// intake channel ends the loop. Always tears down and drains queued
    /// jobs on the way out.
    pub fn run(mut self) {
        let mut next_beat = Instant::now() + self.config.heartbeat_interval;
        loop {
            let timeout = next_beat.saturating_duration_since(Instant::now());
            match self.jobs.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    self.shared.mark_busy();
                    let beat = self.ping();
                    self.shared.mark_idle();
                    if let Err(e) = beat {
                        warn!("worker {}: heartbeat failed: {e}", self.peer);
                        break;
                    }
                    next_beat = Instant::now() + self.config.heartbeat_interval;
                }
                Ok(job) => {
                    if self.shared.stopped.load(Ordering::SeqCst) {
                        job.complete(Err(EngineError::Stopped));
                        continue;
                    }
                    self.shared.mark_busy();
                    let fatal = self.execute(job);
                    self.shared.mark_idle();
                    if fatal {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shared.teardown();
        while let Ok(job) = self.jobs.try_recv() {
            debug!("worker {}: draining queued job after shutdown", self.peer);
            job.complete(Err(EngineError::Stopped));
        }
    }

    /// Runs one job to completion and reports the outcome to its caller.
    /// Returns whether the failure poisoned the stream.
    fn execute(&mut self, job: Job) -> bool {
        let (command, payload, done) = job.into_parts();
        let outcome = self.dispatch(command, payload);
        // A remote error line or a bad submission leaves the stream aligned;
        // anything touching transport framing does not.
        let fatal = matches!(
            &outcome,
            Err(EngineError::Io(_)) | Err(EngineError::Protocol(_))
        );
        if let Err(e) = &outcome {
            if fatal {
                warn!("worker {}: command failed fatally: {e}", self.peer);
            } else {
                debug!("worker {}: command failed: {e}", self.peer);
            }
        }
        let _ = done.send(outcome);
        fatal
    }

    fn dispatch(&mut self, command: Command, payload: Payload) -> Outcome {
        match (command.tag, payload) {
            (Tag::Get, Payload::Collect) => self.get(&command),
            (Tag::GetStream, Payload::Sink(mut sink)) => self.get_stream(&command, sink.as_mut()),
            (Tag::Put, Payload::None) => self.put(&command),
            (Tag::PutFromReader, Payload::Source(mut source)) => {
                self.put_from_source(&command, source.as_mut())
            }
            // Never written to the socket: a tag the dispatcher does not
            // recognize would desynchronize the stream.
            (tag, _) => Err(EngineError::UnknownCommand(
                String::from_utf8_lossy(tag.as_bytes()).into_owned(),
            )),
        }
    }

    /// Writes `command` and reads the status line; a non-OK line's text is
    /// the worker's error message.
    fn exchange(&mut self, command: &Command) -> Result<(), EngineError> {
        command.write_to(&mut self.writer)?;
        let line = wire::read_line(&mut self.reader)?;
        if Tag::from_bytes(&line) == Some(Tag::Ok) {
            Ok(())
        } else {
            Err(EngineError::Remote(
                String::from_utf8_lossy(&line).into_owned(),
            ))
        }
    }

    fn get(&mut self, command: &Command) -> Outcome {
        self.exchange(command)?;
        Ok(Some(wire::read_body(&mut self.reader)?))
    }

    fn get_stream(&mut self, command: &Command, sink: &mut (dyn Write + Send)) -> Outcome {
        self.exchange(command)?;
        wire::copy_body(&mut self.reader, sink)?;
        Ok(None)
    }

    fn put(&mut self, command: &Command) -> Outcome {
        self.exchange(command)?;
        Ok(None)
    }

    fn put_from_source(&mut self, command: &Command, source: &mut (dyn Read + Send)) -> Outcome {
        self.exchange(command)?;
        io::copy(source, &mut self.writer)?;
        self.writer.flush()?;
        Ok(None)
    }

    /// One heartbeat exchange under explicit deadlines. A timeout reads as an
    /// I/O error and is fatal: a torn frame cannot be resynchronized.
    fn ping(&mut self) -> Result<(), EngineError> {
        self.writer.set_write_timeout(Some(self.config.write_timeout))?;
        self.writer.set_read_timeout(Some(self.config.read_timeout))?;
        let result = self.ping_exchange();
        // Deadlines bound only the heartbeat; job reads may block freely.
        let _ = self.writer.set_write_timeout(None);
        let _ = self.writer.set_read_timeout(None);
        result
    }

    fn ping_exchange(&mut self) -> Result<(), EngineError> {
        Command::new(Tag::Ping, vec![]).write_to(&mut self.writer)?;
        let line = wire::read_line(&mut self.reader)?;
        if Tag::from_bytes(&line) != Some(Tag::Ok) {
            return Err(EngineError::Protocol(format!(
                "heartbeat response was '{}'",
                String::from_utf8_lossy(&line)
            )));
        }
        let body = wire::read_body(&mut self.reader)?;
        let beat: Heartbeat = serde_json::from_slice(&body)?;
        info!(
            "worker {} heartbeat: hit={} cachedsize={} gets={} puts={} maxcachesize={}",
            self.peer, beat.hit, beat.cachedsize, beat.gets, beat.puts, beat.maxcachesize
        );
        *self.shared.last_beat.lock().unwrap() = Some(beat);
        Ok(())
    }
}
