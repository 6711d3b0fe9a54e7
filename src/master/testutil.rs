//! In-process scripted worker used by the engine, registry and server tests.
use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::message::{Heartbeat, Login};
use crate::wire::{self, Command, Tag};

use super::engine::{Driver, Engine, EngineConfig};

/// Behavior knobs for a scripted worker.
pub(crate) struct WorkerScript {
    pub addr: String,
    /// When false, every PING is answered with an error line instead of
    /// OK + statistics.
    pub healthy_heartbeat: bool,
    pub heartbeat: Heartbeat,
    /// Artificial delay before answering any command, to hold the
    /// connection's busy window open.
    pub response_delay: Duration,
    /// Exact byte count the worker reads after acknowledging a
    /// PUT_FROM_READER.
    pub source_len: usize,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            addr: "10.0.0.1:9000".into(),
            healthy_heartbeat: true,
            heartbeat: Heartbeat::default(),
            response_delay: Duration::ZERO,
            source_len: 0,
        }
    }
}

/// Speaks the worker side of the protocol over `stream` until the master
/// hangs up: LOGIN handshake first, then answers commands against an
/// in-memory map.
fn run_worker(stream: TcpStream, script: WorkerScript) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    let login = serde_json::to_vec(&Login {
        addr: script.addr.clone(),
    })
    .unwrap();
    Command::with_body(Tag::Login, vec![], login)
        .write_to(&mut writer)
        .unwrap();
    match wire::read_line(&mut reader) {
        Ok(line) if line == b"OK" => {}
        _ => return,
    }

    let mut store: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    loop {
        let line = match wire::read_line(&mut reader) {
            Ok(line) => line,
            Err(_) => return,
        };
        thread::sleep(script.response_delay);

        let write_result = match Tag::from_bytes(&line) {
            Some(Tag::Ping) => {
                if script.healthy_heartbeat {
                    let stats = serde_json::to_vec(&script.heartbeat).unwrap();
                    Command::with_body(Tag::Ok, vec![], stats).write_to(&mut writer)
                } else {
                    writer.write_all(b"worker on fire\n")
                }
            }
            Some(Tag::Get) | Some(Tag::GetStream) => {
                let key = match wire::read_line(&mut reader) {
                    Ok(key) => key,
                    Err(_) => return,
                };
                match store.get(&key) {
                    Some(value) => {
                        Command::with_body(Tag::Ok, vec![], value.clone()).write_to(&mut writer)
                    }
                    None => writer.write_all(b"no such key\n"),
                }
            }
            Some(Tag::Put) => {
                let frame = wire::read_line(&mut reader)
                    .and_then(|key| wire::read_body(&mut reader).map(|value| (key, value)));
                match frame {
                    Ok((key, value)) => {
                        store.insert(key, value);
                        Command::new(Tag::Ok, vec![]).write_to(&mut writer)
                    }
                    Err(_) => return,
                }
            }
            Some(Tag::PutFromReader) => {
                let key = match wire::read_line(&mut reader) {
                    Ok(key) => key,
                    Err(_) => return,
                };
                if Command::new(Tag::Ok, vec![]).write_to(&mut writer).is_err() {
                    return;
                }
                let mut value = vec![0u8; script.source_len];
                if reader.read_exact(&mut value).is_err() {
                    return;
                }
                store.insert(key, value);
                Ok(())
            }
            _ => return,
        };
        if write_result.is_err() {
            return;
        }
    }
}

/// Spawns a scripted worker that dials `address` like a real node would.
pub(crate) fn dial_as_worker(address: SocketAddr, script: WorkerScript) -> JoinHandle<()> {
    thread::spawn(move || {
        let stream = TcpStream::connect(address).unwrap();
        run_worker(stream, script);
    })
}

/// Accepts one scripted worker over loopback and runs the handshake,
/// returning the engine pieces plus the worker thread.
pub(crate) fn handshake_pair(
    script: WorkerScript,
    config: EngineConfig,
) -> (Arc<Engine>, Driver, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let worker = dial_as_worker(listener.local_addr().unwrap(), script);
    let (stream, _) = listener.accept().unwrap();
    let (engine, driver) = Engine::handshake(stream, config).unwrap();
    (engine, driver, worker)
}

/// Keeps the loop and worker threads alive for a test's duration and shuts
/// everything down when dropped.
pub(crate) struct EngineGuard {
    engine: Arc<Engine>,
    driver: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.engine.close();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Fully wired engine: handshake done, loop running on its own thread.
pub(crate) fn ready_engine(script: WorkerScript) -> (Arc<Engine>, EngineGuard) {
    ready_engine_with(script, EngineConfig::default())
}

pub(crate) fn ready_engine_with(
    script: WorkerScript,
    config: EngineConfig,
) -> (Arc<Engine>, EngineGuard) {
    let (engine, driver, worker) = handshake_pair(script, config);
    let driver = thread::spawn(move || driver.run());
    (
        Arc::clone(&engine),
        EngineGuard {
            engine,
            driver: Some(driver),
            worker: Some(worker),
        },
    )
}
