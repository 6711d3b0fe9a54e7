//! Listener accepting worker dial-ins.
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::{info, warn};

use super::engine::{Engine, EngineConfig};
use super::registry::Registry;

/// Accepts worker connections and keeps the registry in sync with their
/// lifetimes: a worker is registered the moment its handshake succeeds and
/// unregistered the moment its connection loop exits.
pub struct MasterServer {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: EngineConfig,
}

impl MasterServer {
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address)?,
            registry: Arc::new(Registry::new()),
            config: EngineConfig::default(),
        })
    }

    /// Registry handle for the client-facing routing component.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; each worker connection gets a dedicated thread for the
    /// lifetime of its engine.
    pub fn serve(&self) -> io::Result<()> {
        info!("listening for workers at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let registry = Arc::clone(&self.registry);
                    let config = self.config.clone();
                    thread::spawn(move || serve_worker(stream, registry, config));
                }
                Err(e) => warn!("broken worker connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn serve_worker(stream: TcpStream, registry: Arc<Registry>, config: EngineConfig) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            warn!("dropping worker connection without a peer address: {e}");
            return;
        }
    };

    match Engine::handshake(stream, config) {
        Ok((engine, driver)) => {
            let id = engine.login().addr.clone();
            info!("worker '{id}' joined from {peer}");
            registry.register(&id, engine);
            driver.run();
            registry.unregister(&id);
            info!("worker '{id}' left");
        }
        Err(e) => warn!("worker handshake from {peer} failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::super::testutil::{dial_as_worker, WorkerScript};
    use super::*;

    #[test]
    fn workers_join_fetch_and_leave() {
        let server = MasterServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let registry = server.registry();
        let address = server.local_addr().unwrap();
        thread::spawn(move || server.serve());

        let script = WorkerScript {
            addr: "10.0.0.1:9000".into(),
            ..WorkerScript::default()
        };
        let worker = dial_as_worker(address, script);

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.is_empty() {
            assert!(Instant::now() < deadline, "worker never registered");
            thread::sleep(Duration::from_millis(10));
        }

        let engine = registry.select_worker().unwrap();
        assert_eq!(engine.login().addr, "10.0.0.1:9000");
        engine.store("k", b"v".to_vec()).unwrap();
        assert_eq!(engine.fetch("k").unwrap(), b"v");

        engine.close();
        worker.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.is_empty() {
            assert!(Instant::now() < deadline, "worker never unregistered");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
