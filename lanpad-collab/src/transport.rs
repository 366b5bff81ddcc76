//! UDP runtime for a session.
//!
//! One background task owns the receive side of the socket and both timers.
//! Every input, whether a datagram, a tick or a local edit from the handle,
//! goes through the same engine lock, so remote merges and local edits never
//! interleave.
//!
//! ```text
//!   SessionHandle ──edit──┐
//!                         ▼
//!   recv_from ────► Mutex<SessionEngine> ────► Vec<Outbound> ──► send_to
//!   check tick  ──────────▲   ▲                (lock released)
//!   sweep tick  ──────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collaborator::{Collaborator, NetworkInterface};
use crate::config::SessionConfig;
use crate::error::CollabError;
use crate::peers::PeerRecord;
use crate::protocol::Framing;
use crate::session::{Outbound, SessionEngine, SessionState, Target};

/// Receive buffer size; the largest UDP payload.
const RECV_BUFFER: usize = 65_536;

/// Sending half shared by the driver task and the handle.
#[derive(Clone)]
struct Outlet {
    socket: Arc<UdpSocket>,
    broadcast: SocketAddr,
    framing: Framing,
}

impl Outlet {
    /// Fire-and-forget delivery; failures are logged, never retried.
    async fn send_all(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            let destination = match out.target {
                Target::Broadcast => self.broadcast,
                Target::Peer(addr) => addr,
            };
            let bytes = match out.envelope.encode(self.framing) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Failed to encode {}: {e}", out.envelope.message.kind());
                    continue;
                }
            };
            match self.socket.send_to(&bytes, destination).await {
                Ok(_) => log::trace!(
                    "Sent {} ({} bytes) to {destination}",
                    out.envelope.message.kind(),
                    bytes.len()
                ),
                Err(e) => log::warn!(
                    "Failed to send {} to {destination}: {e}",
                    out.envelope.message.kind()
                ),
            }
        }
    }
}

/// A running session bound to a UDP socket.
pub struct SessionHandle {
    engine: Arc<Mutex<SessionEngine>>,
    outlet: Outlet,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Bind the socket and spawn the driver task. Starts in `Solo`.
    pub async fn start(
        config: SessionConfig,
        interface: &dyn NetworkInterface,
        collaborator: Box<dyn Collaborator>,
    ) -> Result<Self, CollabError> {
        let socket = UdpSocket::bind((config.bind_addr, config.port)).await?;
        socket.set_broadcast(true)?;
        let bound = socket.local_addr()?;

        let local_addr = SocketAddr::new(interface.local_address(), bound.port());
        let broadcast = SocketAddr::new(interface.broadcast_address(), config.broadcast_port);
        log::info!(
            "Session '{}' listening on {bound}, advertising {local_addr}, broadcasting to {broadcast}",
            config.display_name
        );

        let outlet = Outlet {
            socket: Arc::new(socket),
            broadcast,
            framing: config.framing,
        };
        let engine = Arc::new(Mutex::new(SessionEngine::new(
            config.clone(),
            local_addr,
            collaborator,
        )));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(drive(
            Arc::clone(&engine),
            outlet.clone(),
            config,
            shutdown_rx,
        ));

        Ok(Self {
            engine,
            outlet,
            local_addr,
            shutdown_tx,
            driver: Some(driver),
        })
    }

    /// Address advertised to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn state(&self) -> SessionState {
        self.engine.lock().await.state()
    }

    pub async fn text(&self) -> String {
        self.engine.lock().await.text()
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.engine.lock().await.peers().peers()
    }

    /// Start hosting the current document.
    pub async fn share(&self) -> Result<(), CollabError> {
        let out = self.engine.lock().await.share()?;
        self.outlet.send_all(out).await;
        Ok(())
    }

    /// Leave the session; the socket stays open in `Solo`.
    pub async fn disconnect(&self) {
        let out = self.engine.lock().await.disconnect();
        self.outlet.send_all(out).await;
    }

    pub async fn insert_at(&self, index: usize, ch: char) -> Result<(), CollabError> {
        let out = self.engine.lock().await.local_insert_at(index, ch)?;
        self.outlet.send_all(out).await;
        Ok(())
    }

    pub async fn delete_at(&self, index: usize) -> Result<(), CollabError> {
        let out = self.engine.lock().await.local_delete_at(index)?;
        self.outlet.send_all(out).await;
        Ok(())
    }

    /// Replace the whole text; only the changed span is broadcast.
    pub async fn replace_text(&self, text: &str) -> Result<(), CollabError> {
        let out = self.engine.lock().await.replace_text(text)?;
        self.outlet.send_all(out).await;
        Ok(())
    }

    /// Leave the session, stop the driver and release the socket.
    pub async fn shutdown(mut self) -> Result<(), CollabError> {
        self.disconnect().await;
        let _ = self.shutdown_tx.send(true);
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                log::warn!("Session driver ended abnormally: {e}");
            }
        }
        log::info!("Session on {} shut down", self.local_addr);
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Receive loop and timers. Exits when the shutdown flag flips.
async fn drive(
    engine: Arc<Mutex<SessionEngine>>,
    outlet: Outlet,
    config: SessionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER];

    let mut check = tokio::time::interval(config.state_check_interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = check.tick() => {
                let out = engine.lock().await.on_check_tick(Instant::now());
                outlet.send_all(out).await;
            }
            _ = sweep.tick() => {
                engine.lock().await.on_sweep_tick(Instant::now());
            }
            received = tokio::time::timeout(config.recv_timeout, outlet.socket.recv_from(&mut buf)) => {
                match received {
                    // Idle; loop around so shutdown and timers stay responsive.
                    Err(_) => {}
                    Ok(Ok((len, from))) => {
                        let out = engine
                            .lock()
                            .await
                            .handle_datagram(&buf[..len], from, Instant::now());
                        outlet.send_all(out).await;
                    }
                    Ok(Err(e)) => log::warn!("UDP receive failed: {e}"),
                }
            }
        }
    }

    log::debug!("Session driver stopped");
}
