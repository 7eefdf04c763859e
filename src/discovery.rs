use crate::protocol::{self, DEFAULT_DATA_PORT, INFO_PORT, MAX_PACKET_SIZE};
use crate::{OwoError, Result};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sleep between polls when no probe is pending.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ports used by the discovery responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Well-known port the phone broadcasts probes to.
    pub info_port: u16,
    /// Data port announced in replies.
    pub data_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            info_port: INFO_PORT,
            data_port: DEFAULT_DATA_PORT,
        }
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Answers "where do I send data" probes from the phone app.
///
/// Runs on its own thread. A socket failure ends the thread and leaves
/// `is_running()` false; the owner has to `restart` it.
pub struct DiscoveryResponder {
    config: DiscoveryConfig,
    worker: Option<Worker>,
}

impl DiscoveryResponder {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            worker: None,
        }
    }

    pub fn config(&self) -> DiscoveryConfig {
        self.config
    }

    /// Bind the info port and spawn the responder thread.
    ///
    /// Does nothing if a responder is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // Reap a worker that died on its own.
        self.stop();

        let port = self.config.info_port;
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|e| OwoError::from_bind(e, port))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let data_port = self.config.data_port;

        let thread = std::thread::Builder::new()
            .name("owo-discovery".into())
            .spawn(move || {
                discovery_loop(socket, data_port, running_clone);
            })
            .map_err(|e| OwoError::WorkerSpawn(e.to_string()))?;

        log::info!(
            "Discovery responder on {} announcing data port {}",
            local_addr,
            data_port
        );

        self.worker = Some(Worker {
            running,
            local_addr,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop any running responder, then start one announcing `data_port`.
    pub fn restart(&mut self, data_port: u16) -> Result<()> {
        self.config.data_port = data_port;
        self.stop();
        self.start()
    }

    /// Stop the responder and release the socket. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.running.store(false, Ordering::Relaxed);
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
            log::debug!("Discovery responder on {} stopped", worker.local_addr);
        }
    }

    /// Whether the responder thread is alive and serving.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| w.running.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Address the responder is bound to, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The discovery loop runs in a dedicated thread and owns the socket.
fn discovery_loop(socket: UdpSocket, data_port: u16, running: Arc<AtomicBool>) {
    let response = protocol::build_discovery_response(data_port);
    let mut buf = [0u8; MAX_PACKET_SIZE];

    while running.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                log::error!("Discovery socket failed: {}", e);
                break;
            }
        };

        if !protocol::is_discovery_request(&buf[..len]) {
            log::trace!("Ignoring {} byte datagram from {}", len, from);
            continue;
        }

        if let Err(e) = socket.send_to(response.as_bytes(), from) {
            log::error!("Discovery reply to {} failed: {}", from, e);
            break;
        }
        log::debug!("Answered discovery probe from {}", from);
    }

    running.store(false, Ordering::Relaxed);
}
